// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Newtype wrappers for validated inputs and the persisted process model.
//!
//! All identifier types validate their invariants at creation time, so the
//! rest of the crate never sees an empty job id or a zero pid.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Validated job identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores, max 128 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id,
                reason: "Job ID cannot be empty".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id.clone(),
                reason: format!("Job ID too long: {} chars (max 128)", id.len()),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id,
                reason: "Job ID must contain only alphanumeric characters, hyphens, and underscores"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Validated process ID. Must be positive (non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid(i32);

impl Pid {
    pub fn new(pid: i32) -> Result<Self, HardValidationError> {
        if pid <= 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "pid",
                value: pid.to_string(),
                reason: "Process ID must be positive".to_string(),
            });
        }
        Ok(Self(pid))
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Pid> for i32 {
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

/// One open descriptor of the target process at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFd {
    pub fd: i32,
    pub path: String,
    /// Kernel open flags as reported by fdinfo (octal value, host order).
    pub flags: u32,
}

/// Descriptor of the running process captured at dump time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    #[serde(default)]
    pub open_fds: Vec<OpenFd>,
    /// Absolute host paths of regular files the process held open for
    /// writing. Their contents are copied aside at dump time and replayed
    /// at restore time.
    #[serde(default)]
    pub open_write_only_file_paths: Vec<String>,
}

impl ProcessInfo {
    /// Pseudoterminal heuristic: any recorded descriptor path containing
    /// the substring `pts` marks the process as a shell job.
    pub fn has_pty(&self) -> bool {
        self.open_fds.iter().any(|f| f.path.contains("pts"))
    }
}

/// Operation timestamps carried with a process state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub captured_at: Option<DateTime<Utc>>,
    pub dump_started_at: Option<DateTime<Utc>>,
    pub dump_finished_at: Option<DateTime<Utc>>,
    pub restore_started_at: Option<DateTime<Utc>>,
    pub restore_finished_at: Option<DateTime<Utc>>,
}

/// Persisted record of one (job, process-instance).
///
/// Created at the start of a dump, written to the index once the dump
/// completes with `checkpoint_path` filled in, and read (never mutated)
/// during restore. Serialized as `checkpoint_state.json` at the root of
/// every snapshot archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: i32,
    pub job_id: String,
    #[serde(default)]
    pub process_info: ProcessInfo,
    /// Absolute path or remote URI of the last produced snapshot.
    #[serde(default)]
    pub checkpoint_path: String,
    #[serde(default)]
    pub gpu_checkpointed: bool,
    #[serde(default)]
    pub timestamps: Timestamps,
}

impl ProcessState {
    pub fn new(pid: Pid, job_id: &JobId, process_info: ProcessInfo) -> Self {
        Self {
            pid: pid.value(),
            job_id: job_id.as_str().to_string(),
            process_info,
            checkpoint_path: String::new(),
            gpu_checkpointed: false,
            timestamps: Timestamps {
                captured_at: Some(Utc::now()),
                ..Timestamps::default()
            },
        }
    }
}
