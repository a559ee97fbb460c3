//! Engine notification callbacks.
//!
//! CRIU raises named script-style callbacks mid-operation and waits for an
//! acknowledgement before proceeding. The transport parses each into a
//! typed [`Callback`] and dispatches it to a caller-supplied
//! [`CheckpointHooks`] implementation. Unknown callback names are ignored
//! by policy, so newer engines keep working against this coordinator.

use crate::error::StasisError;

/// The callback kinds the engine can raise, in the order they appear
/// around a dump or restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    PreDump,
    PostDump,
    PreRestore,
    PostRestore { pid: i32 },
    NetworkLock,
    NetworkUnlock,
    SetupNamespaces { pid: i32 },
    PostSetupNamespaces,
    PreResume,
    PostResume,
}

impl Callback {
    /// Map a script name (plus the pid some callbacks carry) to a typed
    /// callback. Returns `None` for names this coordinator does not know,
    /// which the caller must treat as a no-op.
    pub fn parse(script: &str, pid: i32) -> Option<Self> {
        match script {
            "pre-dump" => Some(Self::PreDump),
            "post-dump" => Some(Self::PostDump),
            "pre-restore" => Some(Self::PreRestore),
            "post-restore" => Some(Self::PostRestore { pid }),
            "network-lock" => Some(Self::NetworkLock),
            "network-unlock" => Some(Self::NetworkUnlock),
            "setup-namespaces" => Some(Self::SetupNamespaces { pid }),
            "post-setup-namespaces" => Some(Self::PostSetupNamespaces),
            "pre-resume" => Some(Self::PreResume),
            "post-resume" => Some(Self::PostResume),
            _ => None,
        }
    }
}

/// Per-operation hook table supplied by the coordinator.
///
/// Hooks run serially on the transport's thread; an error aborts the
/// enclosing operation before the engine receives its acknowledgement.
pub trait CheckpointHooks {
    fn pre_dump(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn post_dump(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn pre_restore(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn post_restore(&mut self, pid: i32) -> Result<(), StasisError> {
        let _ = pid;
        Ok(())
    }

    fn network_lock(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn network_unlock(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn setup_namespaces(&mut self, pid: i32) -> Result<(), StasisError> {
        let _ = pid;
        Ok(())
    }

    fn post_setup_namespaces(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn pre_resume(&mut self) -> Result<(), StasisError> {
        Ok(())
    }

    fn post_resume(&mut self) -> Result<(), StasisError> {
        Ok(())
    }
}

/// Route one callback to its hook.
pub fn dispatch(hooks: &mut dyn CheckpointHooks, callback: Callback) -> Result<(), StasisError> {
    match callback {
        Callback::PreDump => hooks.pre_dump(),
        Callback::PostDump => hooks.post_dump(),
        Callback::PreRestore => hooks.pre_restore(),
        Callback::PostRestore { pid } => hooks.post_restore(pid),
        Callback::NetworkLock => hooks.network_lock(),
        Callback::NetworkUnlock => hooks.network_unlock(),
        Callback::SetupNamespaces { pid } => hooks.setup_namespaces(pid),
        Callback::PostSetupNamespaces => hooks.post_setup_namespaces(),
        Callback::PreResume => hooks.pre_resume(),
        Callback::PostResume => hooks.post_resume(),
    }
}

/// No-op hook table for operations that do not care about callbacks.
#[derive(Default, Clone, Copy, Debug)]
pub struct NoopHooks;

impl CheckpointHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CriuError;

    struct Recording {
        seen: Vec<&'static str>,
        fail_on: Option<&'static str>,
    }

    impl Recording {
        fn hit(&mut self, name: &'static str) -> Result<(), StasisError> {
            self.seen.push(name);
            if self.fail_on == Some(name) {
                return Err(StasisError::Criu(CriuError::Engine {
                    message: format!("hook {name} failed"),
                    errno: 0,
                }));
            }
            Ok(())
        }
    }

    impl CheckpointHooks for Recording {
        fn pre_dump(&mut self) -> Result<(), StasisError> {
            self.hit("pre-dump")
        }
        fn post_dump(&mut self) -> Result<(), StasisError> {
            self.hit("post-dump")
        }
        fn post_restore(&mut self, _pid: i32) -> Result<(), StasisError> {
            self.hit("post-restore")
        }
        fn pre_resume(&mut self) -> Result<(), StasisError> {
            self.hit("pre-resume")
        }
    }

    #[test]
    fn test_parse_known_names() {
        assert_eq!(Callback::parse("pre-dump", 0), Some(Callback::PreDump));
        assert_eq!(
            Callback::parse("post-restore", 5151),
            Some(Callback::PostRestore { pid: 5151 })
        );
        assert_eq!(
            Callback::parse("setup-namespaces", 7),
            Some(Callback::SetupNamespaces { pid: 7 })
        );
        assert_eq!(Callback::parse("pre-resume", 0), Some(Callback::PreResume));
    }

    #[test]
    fn test_unknown_name_ignored() {
        assert_eq!(Callback::parse("orphan-pts-master", 0), None);
        assert_eq!(Callback::parse("", 0), None);
    }

    #[test]
    fn test_dispatch_order() {
        let mut hooks = Recording {
            seen: vec![],
            fail_on: None,
        };
        dispatch(&mut hooks, Callback::PreDump).unwrap();
        dispatch(&mut hooks, Callback::PostDump).unwrap();
        assert_eq!(hooks.seen, vec!["pre-dump", "post-dump"]);
    }

    #[test]
    fn test_hook_error_propagates() {
        let mut hooks = Recording {
            seen: vec![],
            fail_on: Some("pre-resume"),
        };
        let err = dispatch(&mut hooks, Callback::PreResume).unwrap_err();
        assert!(err.to_string().contains("pre-resume"));
    }

    #[test]
    fn test_noop_hooks() {
        let mut hooks = NoopHooks;
        assert!(dispatch(&mut hooks, Callback::NetworkLock).is_ok());
        assert!(dispatch(&mut hooks, Callback::PostResume).is_ok());
    }
}
