// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 Stasis Contributors

//! Snapshot packaging.
//!
//! Builds the on-disk snapshot tree (engine images + auxiliary metadata +
//! copied open files) in an exclusively owned staging directory, then
//! archives it as a single gzipped tar. The restore side re-creates the
//! tree, validating every archive entry path before anything is written.

use std::fs::{self, File};
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tar::Archive;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::error::SnapshotError;
use crate::types::ProcessState;

/// Mandatory archive member describing the checkpointed process.
pub const STATE_FILE: &str = "checkpoint_state.json";

/// Exclusively owned scratch directory used as the engine's image
/// directory for one operation. The tree is removed when the guard is
/// dropped, so it never survives an operation, success or failure.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn create(base: &Path, prefix: &str) -> Result<Self, SnapshotError> {
        fs::create_dir_all(base).map_err(|source| SnapshotError::Staging {
            base: base.to_path_buf(),
            source,
        })?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(base)
            .map_err(|source| SnapshotError::Staging {
                base: base.to_path_buf(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Open the staging directory as an inheritable descriptor for the
    /// engine. Deliberately not close-on-exec: the engine child reaches it
    /// by number.
    pub fn open_dir_fd(&self) -> Result<OwnedFd, SnapshotError> {
        let raw = nix::fcntl::open(
            self.path(),
            OFlag::O_DIRECTORY | OFlag::O_RDONLY,
            Mode::empty(),
        )
        .map_err(|source| SnapshotError::OpenDir {
            path: self.path().to_path_buf(),
            source,
        })?;
        // Freshly opened, owned by no other handle.
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Remove the staging tree, reporting failures. Dropping the guard
    /// removes it silently instead.
    pub fn close(self) -> Result<(), SnapshotError> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|source| SnapshotError::Staging { base: path, source })
    }
}

/// Compress a staging tree into a single gzipped tar at `archive`.
/// The archive file is fsynced before returning so uploads never observe
/// a partially flushed snapshot.
pub fn compress(staging: &Path, archive: &Path) -> Result<(), SnapshotError> {
    let io_err = |source| SnapshotError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let out = File::create(archive).map_err(io_err)?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", staging).map_err(io_err)?;
    let encoder = builder.into_inner().map_err(io_err)?;
    let out = encoder.finish().map_err(io_err)?;
    out.sync_all().map_err(io_err)?;
    Ok(())
}

/// Decompress an archive into a freshly created staging directory.
///
/// Every entry path is validated before any file is written: absolute
/// paths and `..` components are rejected outright. The archive must
/// contain exactly one `checkpoint_state.json` at its root; a second one
/// would silently overwrite the first on unpack. Symlinks are unpacked
/// as-is; the engine re-resolves absolute targets in the restored mount
/// namespace.
pub fn extract(archive: &Path, base: &Path) -> Result<Staging, SnapshotError> {
    let io_err = |source| SnapshotError::Archive {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(io_err)?;
    let mut validation = Archive::new(GzDecoder::new(file));
    let mut state_entries = 0usize;
    for entry in validation.entries().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path().map_err(io_err)?.into_owned();
        validate_entry_path(&path)?;
        if is_root_state_file(&path) {
            state_entries += 1;
        }
    }
    if state_entries == 0 {
        return Err(SnapshotError::MissingStateFile);
    }
    if state_entries > 1 {
        return Err(SnapshotError::DuplicateStateFile {
            count: state_entries,
        });
    }

    let staging = Staging::create(base, "stasis-restore-")?;
    let file = File::open(archive).map_err(io_err)?;
    let mut unpacker = Archive::new(GzDecoder::new(file));
    unpacker.set_preserve_permissions(true);
    unpacker.unpack(staging.path()).map_err(io_err)?;
    Ok(staging)
}

fn validate_entry_path(path: &Path) -> Result<(), SnapshotError> {
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SnapshotError::EntryEscapesRoot {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn is_root_state_file(path: &Path) -> bool {
    let mut parts = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    matches!(
        (parts.next(), parts.next()),
        (Some(Component::Normal(name)), None) if name.to_str() == Some(STATE_FILE)
    )
}

/// Serialize the process state into the staging directory and flush it to
/// disk. The archive step must not start before this returns.
pub fn write_state(staging: &Path, state: &ProcessState) -> Result<(), SnapshotError> {
    let data =
        serde_json::to_vec_pretty(state).map_err(|source| SnapshotError::StateEncode { source })?;
    let path = staging.join(STATE_FILE);
    let mut file = File::create(&path).map_err(|source| SnapshotError::Copy {
        path: path.clone(),
        source,
    })?;
    file.write_all(&data)
        .and_then(|_| file.sync_all())
        .map_err(|source| SnapshotError::Copy { path, source })?;
    Ok(())
}

/// Read the process state back from an extracted staging tree.
pub fn read_state(staging: &Path) -> Result<ProcessState, SnapshotError> {
    let path = staging.join(STATE_FILE);
    if !path.exists() {
        return Err(SnapshotError::MissingStateFile);
    }
    let data = fs::read(&path).map_err(|source| SnapshotError::Copy { path, source })?;
    serde_json::from_slice(&data).map_err(|source| SnapshotError::StateDecode { source })
}

/// Recursively chmod the staging tree so the restoring engine can read
/// every image file regardless of its recorded mode. Symlink entries are
/// skipped; chmod would follow them out of the tree.
pub fn chmod_recursive(root: &Path, mode: u32) -> Result<(), SnapshotError> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| SnapshotError::Chmod {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_symlink() {
            continue;
        }
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode)).map_err(|source| {
            SnapshotError::Chmod {
                path: entry.path().to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}
