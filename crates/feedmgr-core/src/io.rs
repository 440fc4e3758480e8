//! File writes for `.feedmgr/`.
//!
//! The metadata store owns its own durability; these helpers cover the
//! plain files next to it, chiefly `config.yaml`.

use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `data` in one rename.
///
/// The bytes go to a tempfile in the destination directory, which is then
/// persisted over `path`. A reader sees either the old file or the new
/// one, never a truncated config. Missing parent directories are created.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Seed a file that the user may already have edited.
///
/// Returns `true` when the file was created and `false` when an existing
/// file was left alone, so `feedmgr init` can be rerun safely.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        tracing::debug!("{} exists, leaving it unchanged", path.display());
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}
