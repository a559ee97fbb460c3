//! CRIU swrk transport.
//!
//! Spawns the engine as a coprocess in server-worker mode and drives its
//! length-delimited protobuf protocol over a connected SOCK_SEQPACKET pair.
//! Requests and responses are strictly paired; zero or more notifications
//! interleave before the terminal response of the request's own type.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{
    recv, send, sendmsg, socketpair, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType,
};
use nix::unistd::Pid as NixPid;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::criu::notify::{self, Callback, CheckpointHooks};
use crate::criu::rpc::{CriuFeatures, CriuOpts, CriuReq, CriuReqType, CriuResp};
use crate::error::{CriuError, StasisResult};

/// Engine responses are read into a fixed buffer; anything larger is a
/// protocol error (version skew between engine and coordinator).
pub const MAX_MSG_SIZE: usize = 2 * 4096;

/// Maximum basename length accepted by the fd-passing helper.
pub const MAX_NAME_LEN: usize = 4096;

/// Grace period between SIGTERM and SIGKILL when an operation is cancelled.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Handle on the external C/R engine binary.
#[derive(Debug, Clone)]
pub struct Criu {
    binary: PathBuf,
}

impl Criu {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("CRIU_BINARY")
                .unwrap_or_else(|_| "criu".into())
                .into(),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run one engine operation to completion.
    ///
    /// Forks `criu swrk <fd>` with one end of a seqpacket pair, then drives
    /// the request/notify/response loop on the other end. `extra_fds` are
    /// descriptors the engine must be able to reach by number; they are
    /// inherited as-is, so the caller must have opened them without
    /// close-on-exec and keep them alive for the duration of the call.
    ///
    /// Cancellation sends SIGTERM to the engine child and escalates to
    /// SIGKILL after a 5 second grace period; the loop then fails with a
    /// transport error and the child is still reaped.
    pub fn invoke(
        &self,
        req_type: CriuReqType,
        opts: Option<CriuOpts>,
        hooks: Option<&mut dyn CheckpointHooks>,
        extra_fds: &[BorrowedFd<'_>],
        cancel: Option<&CancellationToken>,
    ) -> StasisResult<CriuResp> {
        let (cln, srv) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(|source| CriuError::SocketPair { source })?;

        // The child must not inherit our end of the pair.
        fcntl(cln.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|source| CriuError::SocketPair { source })?;

        let mut child = Command::new(&self.binary)
            .arg("swrk")
            .arg(srv.as_raw_fd().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CriuError::Spawn { source })?;

        // Close the parent's copy of the engine end; the engine holds its own.
        drop(srv);

        let done = Arc::new(AtomicBool::new(false));
        if let Some(token) = cancel {
            spawn_kill_ladder(token.clone(), Arc::clone(&done), child.id());
        }

        let result = drive(&cln, req_type, opts, None, hooks);

        // Closing the socket makes the engine exit even when the loop above
        // bailed out mid-operation, so the wait below cannot hang.
        drop(cln);
        let wait_result = child.wait();
        done.store(true, Ordering::Release);

        let resp = result?;
        let status = wait_result.map_err(|source| CriuError::Wait { source })?;
        if !status.success() {
            return Err(CriuError::ChildFailed {
                status: status.to_string(),
            }
            .into());
        }

        // Keep the inherited descriptors alive until the engine is gone.
        let _ = extra_fds;

        Ok(resp)
    }

    /// Query the engine version, encoded as `major*10000 + minor*100 +
    /// sublevel`. Git builds round the minor level up by one.
    pub fn version(&self) -> StasisResult<i32> {
        let resp = self.invoke(CriuReqType::Version, None, None, &[], None)?;
        let v = resp.version.ok_or(CriuError::UnexpectedResponse {
            expected: CriuReqType::Version as i32,
            got: resp.r#type,
        })?;

        let mut version = v.major_number * 10000 + v.minor_number * 100;
        if let Some(sublevel) = v.sublevel {
            version += sublevel;
        }
        if v.gitid.is_some() {
            version -= version % 100;
            version += 100;
        }
        Ok(version)
    }

    /// Whether the engine is at least the given encoded version.
    pub fn at_least(&self, version: i32) -> StasisResult<bool> {
        Ok(self.version()? >= version)
    }
}

impl Default for Criu {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the swrk request/notify/response loop on a connected seqpacket
/// socket. Exposed separately from [`Criu::invoke`] so a pre-connected
/// engine (or a test double) can be driven directly.
pub fn drive(
    sock: &OwnedFd,
    req_type: CriuReqType,
    mut opts: Option<CriuOpts>,
    features: Option<CriuFeatures>,
    mut hooks: Option<&mut dyn CheckpointHooks>,
) -> StasisResult<CriuResp> {
    if hooks.is_some() {
        if let Some(opts) = opts.as_mut() {
            opts.notify_scripts = Some(true);
        }
    }

    let mut req = CriuReq {
        r#type: req_type as i32,
        opts,
        notify_success: None,
        keep_open: None,
        features,
    };

    loop {
        send_message(sock, &req)?;
        let resp = recv_message(sock)?;

        if !resp.success {
            return Err(CriuError::Engine {
                message: resp.errmsg().to_string(),
                errno: resp.errno(),
            }
            .into());
        }

        if resp.r#type != CriuReqType::Notify as i32 {
            if resp.r#type != req_type as i32 {
                return Err(CriuError::UnexpectedResponse {
                    expected: req_type as i32,
                    got: resp.r#type,
                }
                .into());
            }
            return Ok(resp);
        }

        let hooks: &mut dyn CheckpointHooks = match hooks.as_mut() {
            Some(hooks) => &mut **hooks,
            None => return Err(CriuError::UnexpectedNotify.into()),
        };

        let payload = resp.notify.unwrap_or_default();
        let script = payload.script.as_deref().unwrap_or("");
        let pid = payload.pid.unwrap_or(0);
        match Callback::parse(script, pid) {
            Some(callback) => {
                tracing::debug!(script = script, pid = pid, "engine callback");
                notify::dispatch(hooks, callback)?;
            }
            None => {
                tracing::debug!(script = script, "ignoring unknown engine callback");
            }
        }

        req = CriuReq {
            r#type: CriuReqType::Notify as i32,
            opts: None,
            notify_success: Some(true),
            keep_open: None,
            features: None,
        };
    }
}

fn send_message(sock: &OwnedFd, req: &CriuReq) -> Result<(), CriuError> {
    let buf = req.encode_to_vec();
    // Seqpacket preserves message boundaries; one write is one message.
    let n = send(sock.as_raw_fd(), &buf, MsgFlags::empty())
        .map_err(|source| CriuError::Send { source })?;
    if n != buf.len() {
        return Err(CriuError::Send {
            source: nix::Error::EMSGSIZE,
        });
    }
    Ok(())
}

fn recv_message(sock: &OwnedFd) -> Result<CriuResp, CriuError> {
    let mut buf = vec![0u8; MAX_MSG_SIZE];
    // MSG_TRUNC makes recv report the real datagram length even when it
    // does not fit the buffer, so oversized messages are detectable.
    let n = recv(sock.as_raw_fd(), &mut buf, MsgFlags::MSG_TRUNC)
        .map_err(|source| CriuError::Recv { source })?;
    if n > MAX_MSG_SIZE {
        return Err(CriuError::OversizedResponse {
            size: n,
            max: MAX_MSG_SIZE,
        });
    }
    CriuResp::decode(&buf[..n]).map_err(|source| CriuError::Decode { source })
}

/// Send a raw descriptor across a local-domain socket with the originating
/// file's basename as the message payload, so the receiving end can
/// rebuild the name association. Names of [`MAX_NAME_LEN`] bytes or more
/// are rejected. The borrow on `fd` keeps its owner live until the send
/// completes.
pub fn send_fd(sock: BorrowedFd<'_>, name: &str, fd: BorrowedFd<'_>) -> Result<(), CriuError> {
    if name.len() >= MAX_NAME_LEN {
        return Err(CriuError::NameTooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }

    let iov = [IoSlice::new(name.as_bytes())];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|source| CriuError::Send { source })?;
    Ok(())
}

/// SIGTERM the engine child on cancellation, SIGKILL after the grace
/// period. Exits quietly once the transport reports the child reaped.
fn spawn_kill_ladder(token: CancellationToken, done: Arc<AtomicBool>, child_pid: u32) {
    std::thread::spawn(move || {
        let pid = NixPid::from_raw(child_pid as i32);
        loop {
            if done.load(Ordering::Acquire) {
                return;
            }
            if token.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        tracing::warn!(pid = child_pid, "cancellation: terminating engine child");
        let _ = kill(pid, Signal::SIGTERM);

        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if done.load(Ordering::Acquire) || kill(pid, None).is_err() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        tracing::warn!(pid = child_pid, "engine child survived SIGTERM, killing");
        let _ = kill(pid, Signal::SIGKILL);
    });
}

#[cfg(test)]
mod tests {
    use std::io::IoSliceMut;

    use nix::sys::socket::{recvmsg, ControlMessageOwned};

    use super::*;

    fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .expect("socketpair")
    }

    #[test]
    fn test_send_fd_name_length_boundary() {
        let (a, b) = seqpacket_pair();
        let file = tempfile::tempfile().unwrap();

        let long = "f".repeat(MAX_NAME_LEN);
        let err = send_fd(to_borrowed_fd(&a), &long, to_borrowed(&file)).unwrap_err();
        assert!(matches!(err, CriuError::NameTooLong { len: 4096, .. }));

        let just_under = "f".repeat(MAX_NAME_LEN - 1);
        send_fd(to_borrowed_fd(&a), &just_under, to_borrowed(&file)).unwrap();

        // The peer really receives one descriptor plus the name bytes.
        let mut data = vec![0u8; MAX_NAME_LEN];
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg = nix::cmsg_space!([std::os::fd::RawFd; 1]);
        let msg = recvmsg::<()>(
            b.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .unwrap();
        assert_eq!(msg.bytes, MAX_NAME_LEN - 1);
        let got_fd = msg
            .cmsgs()
            .unwrap()
            .any(|c| matches!(c, ControlMessageOwned::ScmRights(_)));
        assert!(got_fd);
    }

    #[test]
    fn test_cancellation_terminates_engine_child() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-engine.sh");
        let marker = dir.path().join("fake-engine.sh.term");
        // Stand-in engine: never touches the socket, records SIGTERM in a
        // marker file, and takes its own child down with it so the socket
        // actually closes.
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             sleep 300 &\n\
             child=$!\n\
             trap 'kill $child 2>/dev/null; echo terminated > \"$0.term\"; exit 0' TERM\n\
             wait\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            trigger.cancel();
        });

        let criu = Criu::with_binary(&script);
        let start = Instant::now();
        let result = criu.invoke(
            CriuReqType::Dump,
            Some(Default::default()),
            None,
            &[],
            Some(&token),
        );

        assert!(result.is_err());
        // SIGTERM alone must have done it, well before the SIGKILL step.
        assert!(start.elapsed() < KILL_GRACE);
        assert_eq!(
            std::fs::read_to_string(&marker).unwrap().trim(),
            "terminated"
        );
    }

    #[test]
    fn test_recv_rejects_oversized_message() {
        let (a, b) = seqpacket_pair();
        let big = vec![0u8; MAX_MSG_SIZE + 1];
        send(a.as_raw_fd(), &big, MsgFlags::empty()).unwrap();

        let err = recv_message(&b).unwrap_err();
        assert!(matches!(err, CriuError::OversizedResponse { .. }));
    }

    #[test]
    fn test_recv_accepts_max_sized_message() {
        let (a, b) = seqpacket_pair();
        // A maximum-size message that is valid protobuf: a response with a
        // long error string.
        let resp = CriuResp {
            r#type: CriuReqType::Dump as i32,
            success: true,
            cr_errmsg: Some("x".repeat(MAX_MSG_SIZE - 16)),
            ..Default::default()
        };
        let bytes = resp.encode_to_vec();
        assert!(bytes.len() <= MAX_MSG_SIZE);
        send(a.as_raw_fd(), &bytes, MsgFlags::empty()).unwrap();
        assert!(recv_message(&b).is_ok());
    }

    fn to_borrowed(file: &std::fs::File) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        file.as_fd()
    }

    fn to_borrowed_fd(fd: &OwnedFd) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        fd.as_fd()
    }
}
