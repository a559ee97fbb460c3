// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Checkpoint/restore coordinator.
//!
//! Owns the engine handle, the job/state index and the optional remote
//! store, and drives the full dump and restore flows: open-file capture,
//! GPU co-checkpointing, engine invocation with per-operation hooks,
//! snapshot packaging and index bookkeeping.
//!
//! The engine transport itself is synchronous; each operation drives it on
//! a blocking task while the surrounding flow stays async for store I/O
//! and the GPU agent.

use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, GpuConfig};
use crate::criu::rpc::{CriuOpts, CriuReqType};
use crate::criu::{CheckpointHooks, Criu};
use crate::db::Db;
use crate::error::{CriuError, GpuError, HardValidationError, StasisError, StasisResult};
use crate::gpu::{self, GpuAgentClient};
use crate::snapshot::packager::{self, Staging};
use crate::snapshot::files;
use crate::store::CheckpointStore;
use crate::types::{JobId, Pid, ProcessState};

/// Engine log verbosity used for both operations.
const ENGINE_LOG_LEVEL: i32 = 4;

/// Parameters for one dump operation.
#[derive(Debug, Clone)]
pub struct DumpArgs {
    pub pid: Pid,
    pub job_id: JobId,
    /// Directory the archive is written to; defaults to the configured
    /// checkpoint directory.
    pub archive_dir: Option<PathBuf>,
    /// The process is GPU-attached and the agent must co-checkpoint it.
    pub gpu: bool,
}

/// Outcome of a successful dump.
#[derive(Debug, Clone)]
pub struct DumpResult {
    /// Local path or remote URI recorded in the index.
    pub checkpoint_path: String,
    /// The archive as written locally.
    pub archive: PathBuf,
}

/// Parameters for one restore operation. At least one of `job_id` and
/// `checkpoint_path` must be given; a bare job restores its latest
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct RestoreArgs {
    pub job_id: Option<JobId>,
    pub checkpoint_path: Option<String>,
}

/// The coordinator. One instance per daemon; operations may run
/// concurrently on separate tasks.
pub struct Client {
    config: Config,
    criu: Criu,
    db: Db,
    store: Option<CheckpointStore>,
}

impl Client {
    pub fn new(config: Config) -> StasisResult<Self> {
        let db = Db::open(&config.db.path)?;
        let store = match &config.connection.server_url {
            Some(url) => Some(CheckpointStore::new(url)?),
            None => None,
        };
        Ok(Self {
            config,
            criu: Criu::new(),
            db,
            store,
        })
    }

    /// Replace the engine handle (alternate binary path, tests).
    pub fn with_engine(mut self, criu: Criu) -> Self {
        self.criu = criu;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Encoded version of the underlying engine.
    pub fn engine_version(&self) -> StasisResult<i32> {
        self.criu.version()
    }

    /// Snapshot a running process tree into an archive, upload it when a
    /// remote store is configured, and record the result in the index.
    pub async fn dump(
        &self,
        args: DumpArgs,
        cancel: CancellationToken,
    ) -> StasisResult<DumpResult> {
        tracing::info!(pid = args.pid.value(), job = %args.job_id, "starting dump");

        let process_info = files::capture(args.pid)?;
        let mut state = ProcessState::new(args.pid, &args.job_id, process_info);
        state.timestamps.dump_started_at = Some(Utc::now());

        let staging = Staging::create(&self.config.client.staging_dir, "stasis-dump-")?;

        if args.gpu {
            let mut agent = GpuAgentClient::connect(&self.config.gpu.agent_endpoint).await?;
            agent.checkpoint(staging.path(), args.pid.value()).await?;
            state.gpu_checkpointed = true;
            tracing::info!(pid = args.pid.value(), "GPU state checkpointed");
        }

        let dir_fd = staging.open_dir_fd()?;
        let opts = CriuOpts {
            images_dir_fd: dir_fd.as_raw_fd(),
            pid: Some(args.pid.value()),
            leave_running: Some(self.config.client.leave_running),
            ..Default::default()
        };

        let criu = self.criu.clone();
        let engine_cancel = cancel.clone();
        let engine_result = tokio::task::spawn_blocking(move || {
            let mut hooks = OperationHooks::logging("dump");
            let result = criu.invoke(
                CriuReqType::Dump,
                Some(opts),
                Some(&mut hooks),
                &[dir_fd.as_fd()],
                Some(&engine_cancel),
            );
            drop(dir_fd);
            result
        })
        .await
        .map_err(join_error)?;

        // A cancelled operation reports cancellation, not the transport
        // error the engine kill produced.
        if cancel.is_cancelled() {
            return Err(StasisError::Cancelled);
        }
        engine_result?;

        files::copy_out(&state.process_info, staging.path())?;
        state.timestamps.dump_finished_at = Some(Utc::now());

        let archive_dir = args
            .archive_dir
            .unwrap_or_else(|| self.config.client.checkpoint_dir.clone());
        std::fs::create_dir_all(&archive_dir).map_err(|source| StasisError::Io {
            context: "creating checkpoint directory",
            source,
        })?;
        let archive = archive_dir.join(format!(
            "{}_{}.tar.gz",
            args.job_id,
            Utc::now().format("%Y%m%d%H%M%S")
        ));

        state.checkpoint_path = archive.to_string_lossy().into_owned();
        packager::write_state(staging.path(), &state)?;
        packager::compress(staging.path(), &archive)?;

        if let Err(e) = staging.close() {
            tracing::warn!(error = %e, "could not remove staging directory");
        }

        if let Some(store) = &self.store {
            if cancel.is_cancelled() {
                return Err(StasisError::Cancelled);
            }
            let upload_id = store.upload_checkpoint(&archive, &cancel).await?;
            state.checkpoint_path = store.checkpoint_uri(&upload_id);
        }

        self.db.upsert(&args.job_id, &state)?;

        tracing::info!(
            pid = args.pid.value(),
            job = %args.job_id,
            checkpoint = state.checkpoint_path.as_str(),
            "dump complete"
        );
        Ok(DumpResult {
            checkpoint_path: state.checkpoint_path,
            archive,
        })
    }

    /// Reconstitute a process from a snapshot archive and record the new
    /// process instance in the index. Returns the restored PID.
    pub async fn restore(
        &self,
        args: RestoreArgs,
        cancel: CancellationToken,
    ) -> StasisResult<Pid> {
        let source = match (&args.checkpoint_path, &args.job_id) {
            (Some(path), _) => path.clone(),
            (None, Some(job)) => self.db.latest_state(job)?.checkpoint_path,
            (None, None) => {
                return Err(HardValidationError::MissingRequiredField {
                    field: "checkpoint_path",
                    context: "restore (give a job id or an archive path)".to_string(),
                }
                .into())
            }
        };
        if source.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "checkpoint_path",
                context: "restore (job has no recorded checkpoint)".to_string(),
            }
            .into());
        }

        tracing::info!(source = source.as_str(), "starting restore");

        let staging_base = self.config.client.staging_dir.clone();
        let mut fetched = None;
        let local_archive = if CheckpointStore::is_remote(&source) {
            let store = self.store.as_ref().ok_or_else(|| {
                StasisError::HardValidation(HardValidationError::MissingRequiredField {
                    field: "server_url",
                    context: format!("restoring remote checkpoint {source}"),
                })
            })?;
            std::fs::create_dir_all(&staging_base).map_err(|source| StasisError::Io {
                context: "creating staging base",
                source,
            })?;
            let tmp = tempfile::Builder::new()
                .prefix("stasis-fetch-")
                .suffix(".tar.gz")
                .tempfile_in(&staging_base)
                .map_err(|source| StasisError::Io {
                    context: "creating download file",
                    source,
                })?;
            store.download_checkpoint(&source, tmp.path()).await?;
            let path = tmp.path().to_path_buf();
            fetched = Some(tmp);
            path
        } else {
            PathBuf::from(&source)
        };

        let staging = packager::extract(&local_archive, &staging_base)?;
        drop(fetched);

        let mut state = packager::read_state(staging.path())?;
        packager::chmod_recursive(staging.path(), 0o755)?;
        files::restore_written_files(&state.process_info, staging.path());

        let shell_job = self
            .config
            .client
            .shell_job
            .unwrap_or_else(|| state.process_info.has_pty());

        let dir_fd = staging.open_dir_fd()?;
        let opts = CriuOpts {
            images_dir_fd: dir_fd.as_raw_fd(),
            shell_job: Some(shell_job),
            tcp_established: Some(true),
            log_level: Some(ENGINE_LOG_LEVEL),
            log_file: Some("stasis-restore.log".to_string()),
            ..Default::default()
        };

        state.timestamps.restore_started_at = Some(Utc::now());

        let controller: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
        let gpu_plan = state.gpu_checkpointed.then(|| GpuRestorePlan {
            config: self.config.gpu.clone(),
            directory: staging.path().to_path_buf(),
            controller: Arc::clone(&controller),
            handle: tokio::runtime::Handle::current(),
        });

        let criu = self.criu.clone();
        let engine_cancel = cancel.clone();
        let engine_result = tokio::task::spawn_blocking(move || {
            let mut hooks = OperationHooks {
                op: "restore",
                gpu: gpu_plan,
            };
            let result = criu.invoke(
                CriuReqType::Restore,
                Some(opts),
                Some(&mut hooks),
                &[dir_fd.as_fd()],
                Some(&engine_cancel),
            );
            drop(dir_fd);
            result
        })
        .await
        .map_err(join_error)?;

        let resp = match engine_result {
            Ok(resp) => resp,
            Err(e) => {
                // A controller started by the pre-resume hook must not
                // outlive a failed restore.
                if let Some(mut child) = controller.lock().ok().and_then(|mut c| c.take()) {
                    gpu::terminate_controller(&mut child, &self.config.gpu.pidfile);
                }
                if cancel.is_cancelled() {
                    return Err(StasisError::Cancelled);
                }
                return Err(e);
            }
        };

        let restored = resp.restore.ok_or(CriuError::UnexpectedResponse {
            expected: CriuReqType::Restore as i32,
            got: resp.r#type,
        })?;
        let new_pid = Pid::new(restored.pid).map_err(|_| CriuError::Engine {
            message: "engine reported pid 0 for restored process".to_string(),
            errno: 0,
        })?;

        state.pid = new_pid.value();
        state.timestamps.restore_finished_at = Some(Utc::now());

        let job_id = match args.job_id {
            Some(job) => job,
            None => JobId::new(&state.job_id)?,
        };
        state.job_id = job_id.as_str().to_string();
        self.db.upsert(&job_id, &state)?;

        if state.gpu_checkpointed {
            gpu::spawn_exit_watcher(
                new_pid.value(),
                controller,
                self.config.gpu.pidfile.clone(),
            );
        }

        if let Err(e) = staging.close() {
            tracing::warn!(error = %e, "could not remove staging directory");
        }

        tracing::info!(pid = new_pid.value(), job = %job_id, "restore complete");
        Ok(new_pid)
    }

    /// Start a task under a shell and record nothing but its PID; the
    /// caller checkpoints it later by job.
    pub fn run_task(&self, task: &str) -> StasisResult<Pid> {
        if task.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "task",
                context: "run".to_string(),
            }
            .into());
        }

        let child = Command::new("bash")
            .arg("-c")
            .arg(task)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| StasisError::Io {
                context: "spawning task",
                source,
            })?;

        let pid = Pid::new(child.id() as i32)?;
        tracing::info!(pid = pid.value(), task, "started task");
        Ok(pid)
    }
}

/// Everything the pre-resume hook needs to bring the GPU agent up from
/// the engine's thread.
struct GpuRestorePlan {
    config: GpuConfig,
    directory: PathBuf,
    controller: Arc<Mutex<Option<Child>>>,
    handle: tokio::runtime::Handle,
}

/// Per-operation hook table. Dumps only log the engine's progress;
/// restores additionally prime the GPU agent on pre-resume.
struct OperationHooks {
    op: &'static str,
    gpu: Option<GpuRestorePlan>,
}

impl OperationHooks {
    fn logging(op: &'static str) -> Self {
        Self { op, gpu: None }
    }

    fn trace(&self, callback: &'static str) {
        tracing::debug!(op = self.op, callback, "engine callback");
    }
}

impl CheckpointHooks for OperationHooks {
    fn pre_dump(&mut self) -> Result<(), StasisError> {
        self.trace("pre-dump");
        Ok(())
    }

    fn post_dump(&mut self) -> Result<(), StasisError> {
        self.trace("post-dump");
        Ok(())
    }

    fn pre_restore(&mut self) -> Result<(), StasisError> {
        self.trace("pre-restore");
        Ok(())
    }

    fn post_restore(&mut self, pid: i32) -> Result<(), StasisError> {
        tracing::debug!(op = self.op, pid, "engine callback: post-restore");
        Ok(())
    }

    fn network_lock(&mut self) -> Result<(), StasisError> {
        self.trace("network-lock");
        Ok(())
    }

    fn network_unlock(&mut self) -> Result<(), StasisError> {
        self.trace("network-unlock");
        Ok(())
    }

    fn setup_namespaces(&mut self, pid: i32) -> Result<(), StasisError> {
        tracing::debug!(op = self.op, pid, "engine callback: setup-namespaces");
        Ok(())
    }

    fn post_setup_namespaces(&mut self) -> Result<(), StasisError> {
        self.trace("post-setup-namespaces");
        Ok(())
    }

    fn pre_resume(&mut self) -> Result<(), StasisError> {
        self.trace("pre-resume");
        let Some(plan) = &self.gpu else {
            return Ok(());
        };

        let child = gpu::spawn_controller(&plan.config)?;
        if let Ok(mut slot) = plan.controller.lock() {
            *slot = Some(child);
        }

        let endpoint = plan.config.agent_endpoint.clone();
        let directory = plan.directory.clone();
        plan.handle.block_on(async move {
            let mut agent = GpuAgentClient::connect(&endpoint).await?;
            agent.restore(&directory).await?;
            Ok::<(), GpuError>(())
        })?;
        Ok(())
    }

    fn post_resume(&mut self) -> Result<(), StasisError> {
        self.trace("post-resume");
        Ok(())
    }
}

fn join_error(e: tokio::task::JoinError) -> StasisError {
    StasisError::Io {
        context: "engine task",
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_args_require_a_source() {
        let args = RestoreArgs::default();
        assert!(args.job_id.is_none() && args.checkpoint_path.is_none());
    }

    #[tokio::test]
    async fn test_run_task_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db.path = dir.path().join("state.db");
        config.client.staging_dir = dir.path().join("staging");
        let client = Client::new(config).unwrap();
        assert!(client.run_task("   ").is_err());
    }

    #[tokio::test]
    async fn test_run_task_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db.path = dir.path().join("state.db");
        config.client.staging_dir = dir.path().join("staging");
        let client = Client::new(config).unwrap();
        let pid = client.run_task("sleep 0").unwrap();
        assert!(pid.value() > 0);
    }

    #[tokio::test]
    async fn test_restore_without_source_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db.path = dir.path().join("state.db");
        config.client.staging_dir = dir.path().join("staging");
        let client = Client::new(config).unwrap();

        let err = client
            .restore(RestoreArgs::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_restore_unknown_job_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db.path = dir.path().join("state.db");
        config.client.staging_dir = dir.path().join("staging");
        let client = Client::new(config).unwrap();

        let args = RestoreArgs {
            job_id: Some(JobId::new("absent").unwrap()),
            checkpoint_path: None,
        };
        let err = client
            .restore(args, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StasisError::Db(_)));
    }
}
