// Atomic file replacement shared by the ledger and the daemon state record
// Readers in the other process must never observe a half-written file

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Marker embedded in every temp file name, used by stale-temp cleanup
pub const TEMP_MARKER: &str = ".tmp.";

/// Temp path next to `path` (same filesystem, so the rename is atomic)
pub fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");

    Ok(parent.join(format!(
        ".{}{}{}.{}",
        name,
        TEMP_MARKER,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )))
}

/// Atomically replace `path` with `contents` using write-to-temp + fsync + rename
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path)?;

    let write_result = (|| -> Result<()> {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(())
}
