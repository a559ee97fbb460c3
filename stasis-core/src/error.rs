//! Custom error types for the stasis coordinator.
//!
//! Every failure domain gets its own explicit enum - no `Box<dyn Error>`,
//! no `anyhow::Result`. The top-level `StasisError` aggregates them and
//! carries the process exit-code mapping.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the coordinator.
#[derive(Debug, Error)]
pub enum StasisError {
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    #[error("CRIU error: {0}")]
    Criu(#[from] CriuError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("State index error: {0}")]
    Db(#[from] DbError),

    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

impl StasisError {
    /// Process exit code for this error: 1 configuration/argument, 2 engine,
    /// 3 I/O, 4 authentication.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HardValidation(_) | Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => 1,
            Self::Criu(_) | Self::Gpu(_) => 2,
            Self::Store(StoreError::MissingToken) | Self::Store(StoreError::TokenExpired) => 4,
            Self::Snapshot(_) | Self::Db(_) | Self::Store(_) | Self::Io { .. } => 3,
            Self::Cancelled => 3,
        }
    }
}

/// Hard validation errors cause immediate termination with exit code 1.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors raised while driving the CRIU engine coprocess.
#[derive(Debug, Error)]
pub enum CriuError {
    #[error("Failed to create engine socket pair: {source}")]
    SocketPair {
        #[source]
        source: nix::Error,
    },

    #[error("Failed to spawn CRIU engine: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("Engine socket send failed: {source}")]
    Send {
        #[source]
        source: nix::Error,
    },

    #[error("Engine socket receive failed: {source}")]
    Recv {
        #[source]
        source: nix::Error,
    },

    #[error("Engine response of {size} bytes exceeds the {max}-byte message limit")]
    OversizedResponse { size: usize, max: usize },

    #[error("Failed to decode engine response: {source}")]
    Decode {
        #[source]
        source: prost::DecodeError,
    },

    #[error("Engine operation failed (msg:{message} err:{errno})")]
    Engine { message: String, errno: i32 },

    #[error("Unexpected engine response type: expected {expected}, got {got}")]
    UnexpectedResponse { expected: i32, got: i32 },

    #[error("Engine sent a notification but no hooks were registered")]
    UnexpectedNotify,

    #[error("Engine exited with non-zero status: {status}")]
    ChildFailed { status: String },

    #[error("Failed to wait for engine child: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("sendfd: filename too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },
}

/// Errors from snapshot packaging, extraction and open-file handling.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to create staging directory under {base}: {source}")]
    Staging {
        base: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error for {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive entry escapes the staging directory: {path}")]
    EntryEscapesRoot { path: PathBuf },

    #[error("checkpoint_state.json not found at archive root")]
    MissingStateFile,

    #[error("archive has {count} checkpoint_state.json entries at its root, expected exactly one")]
    DuplicateStateFile { count: usize },

    #[error("Failed to decode checkpoint_state.json: {source}")]
    StateDecode {
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode checkpoint state: {source}")]
    StateEncode {
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read descriptors of pid {pid}: {source}")]
    Procfs {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to chmod {path}: {source}")]
    Chmod {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open staging directory {path}: {source}")]
    OpenDir {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// Errors from the GPU checkpoint agent and its controller process.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("Could not connect to GPU agent: {source}")]
    Connect {
        #[source]
        source: tonic::transport::Error,
    },

    #[error("GPU agent call failed: {source}")]
    Rpc {
        #[source]
        source: tonic::Status,
    },

    #[error("GPU agent refused checkpoint request")]
    CheckpointRefused,

    #[error("GPU agent refused restore request")]
    RestoreRefused,

    #[error("Failed to spawn GPU controller: {source}")]
    ControllerSpawn {
        #[source]
        source: std::io::Error,
    },

    #[error("A GPU controller is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    #[error("Failed to write GPU controller pidfile {path}: {source}")]
    Pidfile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the job/process state index.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to open state index: {source}")]
    Open {
        #[source]
        source: sled::Error,
    },

    #[error("State index operation failed: {source}")]
    Storage {
        #[from]
        source: sled::Error,
    },

    #[error("pid 0 returned from state - is process running?")]
    ZeroPid,

    #[error("Could not find job: {job}")]
    JobNotFound { job: String },

    #[error("Could not find state for pid {pid}")]
    PidNotFound { pid: i32 },

    #[error("Corrupt index key {key:?}: expected a decimal pid")]
    KeyParse { key: Vec<u8> },

    #[error("Failed to decode stored state: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode state: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the remote checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("CEDANA_JWT_TOKEN unset - something likely went wrong during instance setup")]
    MissingToken,

    #[error("JWT token expired")]
    TokenExpired,

    #[error("Request to checkpoint store failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("Checkpoint store returned status {status} for {operation}")]
    Status { operation: &'static str, status: u16 },

    #[error("Part {index} failed after {attempts} attempts, upload {upload_id} aborted")]
    PartFailed {
        index: u64,
        attempts: u32,
        upload_id: String,
    },

    #[error("Server part plan does not cover the archive: {part_count} parts of {part_size} bytes for {total} bytes")]
    BadPartPlan {
        part_count: u64,
        part_size: u64,
        total: u64,
    },

    #[error("Downloaded checkpoint missing at {path}")]
    NotDownloaded { path: PathBuf },

    #[error("Failed to read archive {path}: {source}")]
    ReadArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write downloaded checkpoint {path}: {source}")]
    WriteDownload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload cancelled at part boundary")]
    Cancelled,
}

/// Result type alias using StasisError.
pub type StasisResult<T> = Result<T, StasisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let err = StasisError::ConfigParse {
            message: "bad yaml".to_string(),
        };
        assert_eq!(err.exit_code(), 1);

        let err = StasisError::Criu(CriuError::Engine {
            message: "dump failed".to_string(),
            errno: 12,
        });
        assert_eq!(err.exit_code(), 2);

        let err = StasisError::Snapshot(SnapshotError::MissingStateFile);
        assert_eq!(err.exit_code(), 3);

        let err = StasisError::Store(StoreError::TokenExpired);
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_engine_error_message() {
        let err = CriuError::Engine {
            message: "No such process".to_string(),
            errno: 3,
        };
        assert!(err.to_string().contains("No such process"));
        assert!(err.to_string().contains("err:3"));
    }
}
