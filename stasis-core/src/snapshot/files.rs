// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Open-file capture and restoration.
//!
//! The engine persists memory and descriptor state but not the contents of
//! regular files the process held open for writing; a process resumed
//! against stale file contents misbehaves. Capture records those paths at
//! dump time so the packager can copy them aside, and restore re-disperses
//! the copies to their original locations before the engine runs.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::SnapshotError;
use crate::types::{OpenFd, Pid, ProcessInfo};

const O_ACCMODE: u32 = 0o3;
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;

/// Enumerate the open descriptors of `pid` from its procfs descriptor
/// directory. Regular files opened with a write-capable access mode are
/// additionally recorded (by canonical absolute path) as write-only
/// captures.
pub fn capture(pid: Pid) -> Result<ProcessInfo, SnapshotError> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let fd_dir = proc_dir.join("fd");

    let mut info = ProcessInfo::default();
    let entries = fs::read_dir(&fd_dir).map_err(|source| SnapshotError::Procfs {
        pid: pid.value(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| SnapshotError::Procfs {
            pid: pid.value(),
            source,
        })?;
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        // The descriptor can vanish between readdir and readlink.
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };

        let flags = read_fd_flags(&proc_dir, fd).unwrap_or(0);
        info.open_fds.push(OpenFd {
            fd,
            path: target.to_string_lossy().into_owned(),
            flags,
        });

        let access = flags & O_ACCMODE;
        if (access == O_WRONLY || access == O_RDWR) && target.is_absolute() {
            if let Ok(meta) = fs::metadata(&target) {
                if meta.is_file() {
                    let canonical = fs::canonicalize(&target).unwrap_or(target);
                    info.open_write_only_file_paths
                        .push(canonical.to_string_lossy().into_owned());
                }
            }
        }
    }

    tracing::debug!(
        pid = pid.value(),
        open_fds = info.open_fds.len(),
        writable = info.open_write_only_file_paths.len(),
        "captured open descriptors"
    );

    Ok(info)
}

fn read_fd_flags(proc_dir: &Path, fd: i32) -> Option<u32> {
    let text = fs::read_to_string(proc_dir.join("fdinfo").join(fd.to_string())).ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("flags:") {
            return u32::from_str_radix(rest.trim(), 8).ok();
        }
    }
    None
}

/// Copy every captured write-only file into the staging directory, flat,
/// by basename. Failures here fail the dump: the snapshot would otherwise
/// silently miss file contents the process depends on.
pub fn copy_out(info: &ProcessInfo, staging: &Path) -> Result<(), SnapshotError> {
    for recorded in &info.open_write_only_file_paths {
        let src = Path::new(recorded);
        let Some(name) = src.file_name() else {
            continue;
        };
        let dst = staging.join(name);
        fs::copy(src, &dst).map_err(|source| SnapshotError::Copy {
            path: src.to_path_buf(),
            source,
        })?;
        tracing::debug!(src = recorded.as_str(), dst = %dst.display(), "copied open file");
    }
    Ok(())
}

/// Walk the extracted staging tree and copy each file whose basename
/// matches a recorded write-only path back to that path, creating parent
/// directories with mode 0755. Duplicate basenames resolve to the first
/// recorded match. Best-effort: failures are logged and skipped.
pub fn restore_written_files(info: &ProcessInfo, staging: &Path) {
    if info.open_write_only_file_paths.is_empty() || !staging.exists() {
        return;
    }

    // First recorded path per basename wins.
    let mut by_basename: HashMap<&str, &str> = HashMap::new();
    for recorded in &info.open_write_only_file_paths {
        if let Some(name) = Path::new(recorded).file_name().and_then(|n| n.to_str()) {
            by_basename.entry(name).or_insert(recorded);
        }
    }

    for entry in WalkDir::new(staging) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable staging entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(&recorded) = by_basename.get(name) else {
            continue;
        };

        let target = Path::new(recorded);
        if let Some(parent) = target.parent() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true).mode(0o755);
            if let Err(e) = builder.create(parent) {
                tracing::warn!(path = %parent.display(), error = %e, "could not create target directory");
                continue;
            }
        }

        match fs::copy(entry.path(), target) {
            Ok(_) => {
                tracing::info!(src = %entry.path().display(), dst = recorded, "restored open file")
            }
            Err(e) => {
                tracing::warn!(src = %entry.path().display(), dst = recorded, error = %e, "could not restore open file")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpenFd;

    #[test]
    fn test_capture_own_descriptors() {
        // Any process has at least stdio open; capture ourselves.
        let pid = Pid::new(std::process::id() as i32).unwrap();
        let info = capture(pid).unwrap();
        assert!(!info.open_fds.is_empty());
    }

    #[test]
    fn test_capture_records_writable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.log");
        let _file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();

        let pid = Pid::new(std::process::id() as i32).unwrap();
        let info = capture(pid).unwrap();
        let canonical = fs::canonicalize(&path).unwrap();
        assert!(info
            .open_write_only_file_paths
            .iter()
            .any(|p| Path::new(p) == canonical));
    }

    #[test]
    fn test_capture_missing_process() {
        // PID from the far end of the default pid space.
        let pid = Pid::new(4_000_000).unwrap();
        assert!(capture(pid).is_err());
    }

    #[test]
    fn test_copy_out_and_restore_round_trip() {
        let scratch = tempfile::tempdir().unwrap();
        let original_dir = scratch.path().join("var/log");
        fs::create_dir_all(&original_dir).unwrap();
        let original = original_dir.join("app.log");
        fs::write(&original, b"HELLO").unwrap();

        let info = ProcessInfo {
            open_fds: vec![OpenFd {
                fd: 3,
                path: original.to_string_lossy().into_owned(),
                flags: 0o1,
            }],
            open_write_only_file_paths: vec![original.to_string_lossy().into_owned()],
        };

        let staging = scratch.path().join("staging");
        fs::create_dir(&staging).unwrap();
        copy_out(&info, &staging).unwrap();
        assert_eq!(fs::read(staging.join("app.log")).unwrap(), b"HELLO");

        // Simulate restore onto a clean host.
        fs::remove_dir_all(&original_dir).unwrap();
        restore_written_files(&info, &staging);
        assert_eq!(fs::read(&original).unwrap(), b"HELLO");
    }

    #[test]
    fn test_restore_is_best_effort() {
        let scratch = tempfile::tempdir().unwrap();
        let staging = scratch.path().join("staging");
        fs::create_dir(&staging).unwrap();

        // Recorded path exists but no matching file was staged.
        let info = ProcessInfo {
            open_fds: vec![],
            open_write_only_file_paths: vec![scratch
                .path()
                .join("missing.log")
                .to_string_lossy()
                .into_owned()],
        };
        restore_written_files(&info, &staging);
        assert!(!scratch.path().join("missing.log").exists());
    }

    #[test]
    fn test_duplicate_basenames_first_recorded_wins() {
        let scratch = tempfile::tempdir().unwrap();
        let staging = scratch.path().join("staging");
        fs::create_dir(&staging).unwrap();
        fs::write(staging.join("data.txt"), b"payload").unwrap();

        let first = scratch.path().join("a/data.txt");
        let second = scratch.path().join("b/data.txt");
        let info = ProcessInfo {
            open_fds: vec![],
            open_write_only_file_paths: vec![
                first.to_string_lossy().into_owned(),
                second.to_string_lossy().into_owned(),
            ],
        };

        restore_written_files(&info, &staging);
        assert_eq!(fs::read(&first).unwrap(), b"payload");
        assert!(!second.exists());
    }
}
