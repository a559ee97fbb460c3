// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Job/process state index.
//!
//! An embedded ordered key-value store with a two-level layout: one tree
//! per job, named `default/<job_id>`, mapping decimal-PID keys to
//! JSON-serialized [`ProcessState`] values. The cursor-last entry of a job
//! tree is its most recent state. Writers are serialized by the store;
//! reads on absent jobs report not-found rather than an empty state.

use std::path::Path;

use crate::error::DbError;
use crate::types::{JobId, Pid, ProcessState};

const ROOT_PREFIX: &str = "default/";

/// Long-lived handle on the state index. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Db {
    inner: sled::Db,
}

impl Db {
    /// Open (or create) the index at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let inner = sled::open(path).map_err(|source| DbError::Open { source })?;
        Ok(Self { inner })
    }

    fn tree_name(job_id: &str) -> String {
        format!("{ROOT_PREFIX}{job_id}")
    }

    fn job_exists(&self, job_id: &str) -> bool {
        let name = Self::tree_name(job_id);
        self.inner
            .tree_names()
            .iter()
            .any(|n| n.as_ref() == name.as_bytes())
    }

    fn job_tree(&self, job_id: &str) -> Result<sled::Tree, DbError> {
        Ok(self.inner.open_tree(Self::tree_name(job_id))?)
    }

    /// All job trees currently present, in stored (byte) order.
    fn job_trees(&self) -> Result<Vec<sled::Tree>, DbError> {
        let mut trees = Vec::new();
        for name in self.inner.tree_names() {
            if name.as_ref().starts_with(ROOT_PREFIX.as_bytes()) {
                trees.push(self.inner.open_tree(&name)?);
            }
        }
        Ok(trees)
    }

    /// Create or update the record for `(job, state.pid)`. A state with
    /// pid 0 is a process that is not running and is rejected.
    pub fn upsert(&self, job_id: &JobId, state: &ProcessState) -> Result<(), DbError> {
        if state.pid == 0 {
            return Err(DbError::ZeroPid);
        }

        let value = serde_json::to_vec(state).map_err(|source| DbError::Encode { source })?;
        let tree = self.job_tree(job_id.as_str())?;
        tree.insert(state.pid.to_string().as_bytes(), value)?;
        self.inner.flush()?;
        Ok(())
    }

    /// The most recent state recorded for a job (cursor-last entry).
    pub fn latest_state(&self, job_id: &JobId) -> Result<ProcessState, DbError> {
        if !self.job_exists(job_id.as_str()) {
            return Err(DbError::JobNotFound {
                job: job_id.to_string(),
            });
        }
        let tree = self.job_tree(job_id.as_str())?;
        let (_, value) = tree.last()?.ok_or_else(|| DbError::JobNotFound {
            job: job_id.to_string(),
        })?;
        serde_json::from_slice(&value).map_err(|source| DbError::Decode { source })
    }

    /// The key at the job's cursor-last position, parsed as a pid.
    pub fn latest_pid(&self, job_id: &JobId) -> Result<Pid, DbError> {
        if !self.job_exists(job_id.as_str()) {
            return Err(DbError::JobNotFound {
                job: job_id.to_string(),
            });
        }
        let tree = self.job_tree(job_id.as_str())?;
        let (key, _) = tree.last()?.ok_or_else(|| DbError::JobNotFound {
            job: job_id.to_string(),
        })?;
        let text = std::str::from_utf8(&key).map_err(|_| DbError::KeyParse {
            key: key.to_vec(),
        })?;
        let raw: i32 = text.parse().map_err(|_| DbError::KeyParse {
            key: key.to_vec(),
        })?;
        Pid::new(raw).map_err(|_| DbError::KeyParse { key: key.to_vec() })
    }

    /// Scan every job for a record with this pid. On a pid recorded under
    /// more than one job, the first match in stored tree order wins.
    pub fn state_by_pid(&self, pid: Pid) -> Result<ProcessState, DbError> {
        let key = pid.value().to_string();
        for tree in self.job_trees()? {
            if let Some(value) = tree.get(key.as_bytes())? {
                return serde_json::from_slice(&value)
                    .map_err(|source| DbError::Decode { source });
            }
        }
        Err(DbError::PidNotFound { pid: pid.value() })
    }

    /// Locate the (job, pid) record and overwrite it.
    pub fn update_by_pid(&self, pid: Pid, state: &ProcessState) -> Result<(), DbError> {
        let key = pid.value().to_string();
        let value = serde_json::to_vec(state).map_err(|source| DbError::Encode { source })?;
        for tree in self.job_trees()? {
            if tree.get(key.as_bytes())?.is_some() {
                tree.insert(key.as_bytes(), value)?;
                self.inner.flush()?;
                return Ok(());
            }
        }
        Err(DbError::PidNotFound { pid: pid.value() })
    }

    /// Checkpoint paths across all states of a job, in key order.
    pub fn list_checkpoints(&self, job_id: &JobId) -> Result<Vec<String>, DbError> {
        if !self.job_exists(job_id.as_str()) {
            return Err(DbError::JobNotFound {
                job: job_id.to_string(),
            });
        }
        let tree = self.job_tree(job_id.as_str())?;
        let mut checkpoints = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let state: ProcessState =
                serde_json::from_slice(&value).map_err(|source| DbError::Decode { source })?;
            checkpoints.push(state.checkpoint_path);
        }
        Ok(checkpoints)
    }
}
