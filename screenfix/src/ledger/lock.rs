// Exclusive advisory lock on `<ledger>.lock`
// The ledger itself is replaced by rename on every write, so the lock has to
// live on a sibling file whose inode never changes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use tracing::debug;

/// Non-blocking lock attempts before giving up
pub const LOCK_ATTEMPTS: u32 = 6;
/// First backoff delay; doubles after each failed attempt
pub const LOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(25);

/// Held lock; released when dropped
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
    path: PathBuf,
}

/// Why the lock could not be taken
#[derive(Debug)]
pub enum LockFailure {
    /// Another writer held it for every attempt
    Contended { attempts: u32 },
    Io { path: PathBuf, source: io::Error },
}

impl LedgerLock {
    /// Lock file path for a ledger
    pub fn path_for(ledger_path: &Path) -> PathBuf {
        let mut name = ledger_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        ledger_path.with_file_name(name)
    }

    /// Try to take the lock with bounded exponential backoff
    pub fn acquire(ledger_path: &Path) -> Result<Self, LockFailure> {
        let path = Self::path_for(ledger_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockFailure::Io {
                path: path.clone(),
                source,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|source| LockFailure::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        let mut backoff = LOCK_INITIAL_BACKOFF;
        for attempt in 1..=LOCK_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(ref e) if is_contended(e) => {
                    debug!(attempt, path = %path.display(), "ledger lock busy");
                    if attempt < LOCK_ATTEMPTS {
                        thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
                Err(source) => return Err(LockFailure::Io { path, source }),
            }
        }

        Err(LockFailure::Contended {
            attempts: LOCK_ATTEMPTS,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
