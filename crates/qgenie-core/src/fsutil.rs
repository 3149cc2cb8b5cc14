//! Atomic file writes.
//!
//! Files whose presence carries meaning (the unpacked `config.json`, the
//! default extension config) are written to a temp file in the target
//! directory, synced, and renamed into place, so a reader never observes a
//! half-written file.

use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{BundleError, Result};

/// Write `bytes` to `path` atomically, creating parent directories.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| BundleError::Io {
            message: format!("Failed to create directory {}", parent.display()),
            path: Some(parent.to_path_buf()),
            source: Some(e),
        })?;
    }

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| BundleError::Io {
        message: format!("Failed to create temp file in {}", parent.display()),
        path: Some(parent.to_path_buf()),
        source: Some(e),
    })?;

    temp.write_all(bytes).map_err(|e| BundleError::Io {
        message: format!("Failed to write temp file for {}", path.display()),
        path: Some(temp.path().to_path_buf()),
        source: Some(e),
    })?;

    temp.as_file().sync_all().map_err(|e| BundleError::Io {
        message: format!("Failed to sync temp file for {}", path.display()),
        path: Some(temp.path().to_path_buf()),
        source: Some(e),
    })?;

    temp.persist(path).map_err(|e| BundleError::Io {
        message: format!("Failed to rename temp file to {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e.error),
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}
