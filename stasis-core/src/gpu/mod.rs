// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! GPU checkpoint coordination.
//!
//! GPU state is handled by a separate controller process exposing a gRPC
//! service on a fixed local endpoint. At dump time the agent is asked to
//! write its state files into the staging directory before the engine
//! runs; at restore time a fresh controller is spawned from the engine's
//! pre-resume callback and told to restore from the extracted tree. A
//! detached watcher tears the controller down once the restored process
//! exits.

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid as NixPid;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};

use crate::config::GpuConfig;
use crate::error::GpuError;

/// Per-call timeout against the GPU agent.
pub const AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask the agent to write GPU state for `pid` into `directory`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpuCheckpointRequest {
    #[prost(string, tag = "1")]
    pub directory: String,
    #[prost(int32, tag = "2")]
    pub pid: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpuCheckpointResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

/// Ask the agent to re-materialize GPU state from `directory`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpuRestoreRequest {
    #[prost(string, tag = "1")]
    pub directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GpuRestoreResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

/// gRPC client for the GPU controller's checkpoint service.
#[derive(Debug, Clone)]
pub struct GpuAgentClient {
    inner: tonic::client::Grpc<Channel>,
}

impl GpuAgentClient {
    pub async fn connect(endpoint: &str) -> Result<Self, GpuError> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|source| GpuError::Connect { source })?
            .timeout(AGENT_CALL_TIMEOUT)
            .connect()
            .await
            .map_err(|source| GpuError::Connect { source })?;
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    pub async fn checkpoint(&mut self, directory: &Path, pid: i32) -> Result<(), GpuError> {
        let request = GpuCheckpointRequest {
            directory: directory.to_string_lossy().into_owned(),
            pid,
        };
        let response: GpuCheckpointResponse = self
            .unary(request, "/cedanagpu.CedanaGPU/Checkpoint")
            .await?;
        if !response.success {
            return Err(GpuError::CheckpointRefused);
        }
        Ok(())
    }

    pub async fn restore(&mut self, directory: &Path) -> Result<(), GpuError> {
        let request = GpuRestoreRequest {
            directory: directory.to_string_lossy().into_owned(),
        };
        let response: GpuRestoreResponse =
            self.unary(request, "/cedanagpu.CedanaGPU/Restore").await?;
        if !response.success {
            return Err(GpuError::RestoreRefused);
        }
        Ok(())
    }

    async fn unary<M1, M2>(&mut self, request: M1, path: &'static str) -> Result<M2, GpuError>
    where
        M1: prost::Message + Send + Sync + 'static,
        M2: prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|source| GpuError::Connect { source })?;
        let codec: ProstCodec<M1, M2> = ProstCodec::default();
        let response = self
            .inner
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(|source| GpuError::Rpc { source })?;
        Ok(response.into_inner())
    }
}

/// Spawn the GPU controller under the configured uid/gid.
///
/// The agent endpoint is a process-wide singleton; a liveness-checked
/// pidfile enforces at most one controller per host. A stale pidfile
/// (dead pid) is replaced.
pub fn spawn_controller(config: &GpuConfig) -> Result<Child, GpuError> {
    if let Ok(text) = fs::read_to_string(&config.pidfile) {
        if let Ok(pid) = text.trim().parse::<i32>() {
            if kill(NixPid::from_raw(pid), None).is_ok() {
                return Err(GpuError::AlreadyRunning { pid });
            }
        }
        let _ = fs::remove_file(&config.pidfile);
    }

    let child = Command::new(&config.controller_path)
        .uid(config.uid)
        .gid(config.gid)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| GpuError::ControllerSpawn { source })?;

    fs::write(&config.pidfile, child.id().to_string()).map_err(|source| GpuError::Pidfile {
        path: config.pidfile.clone(),
        source,
    })?;

    tracing::info!(
        pid = child.id(),
        uid = config.uid,
        gid = config.gid,
        "started GPU controller"
    );
    Ok(child)
}

/// Stop a controller spawned by [`spawn_controller`] and drop its pidfile.
pub fn terminate_controller(child: &mut Child, pidfile: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = fs::remove_file(pidfile);
}

/// Poll the restored process once a second; when it exits, tear the GPU
/// controller down. At most one watcher exists per restore - the caller
/// hands over the only handle on the controller child.
pub fn spawn_exit_watcher(
    restored_pid: i32,
    controller: Arc<Mutex<Option<Child>>>,
    pidfile: std::path::PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if kill(NixPid::from_raw(restored_pid), None).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tracing::debug!(
            pid = restored_pid,
            "restored process exited, stopping GPU controller"
        );
        let child = controller.lock().ok().and_then(|mut slot| slot.take());
        match child {
            Some(mut child) => terminate_controller(&mut child, &pidfile),
            None => tracing::warn!("no GPU controller handle to stop"),
        }
    })
}
