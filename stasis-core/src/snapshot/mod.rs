//! Snapshot construction and restoration on disk.

pub mod files;
pub mod packager;

pub use packager::{Staging, STATE_FILE};
