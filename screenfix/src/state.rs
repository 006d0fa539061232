// Daemon State Record (state.json)
// Written only by the daemon, always via temp + rename; everyone else reads
// the whole file and decides liveness for themselves.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::persistence::atomic_write;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state record {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state record {} is corrupt", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write state record: {0:#}")]
    Write(anyhow::Error),
}

/// Persisted daemon liveness. `pid` is only meaningful while `listening`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStateRecord {
    pub listening: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_capture: Option<PathBuf>,
    #[serde(default)]
    pub last_capture_at: Option<DateTime<Utc>>,
}

/// How a reader should interpret a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Liveness {
    /// Record says listening and the pid is alive
    Listening { pid: u32 },
    /// Record says listening but the process is gone (crash, kill -9)
    Stale { pid: Option<u32> },
    Stopped,
}

/// Checks whether a pid refers to a live process
pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `kill(pid, 0)`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // 0 and negatives address process groups, never a single daemon
        if pid <= 0 {
            return false;
        }
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: exists but belongs to someone else
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    // TODO(windows): OpenProcess-based check
    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

impl DaemonStateRecord {
    pub fn liveness(&self, probe: &dyn ProcessProbe) -> Liveness {
        if !self.listening {
            return Liveness::Stopped;
        }
        match self.pid {
            Some(pid) if probe.is_alive(pid) => Liveness::Listening { pid },
            pid => Liveness::Stale { pid },
        }
    }

    /// Read the record; `None` when the daemon has never run
    pub fn read(path: &Path) -> Result<Option<Self>, StateError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StateError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Read the record, treating a missing file as "stopped"
    pub fn read_or_default(path: &Path) -> Result<Self, StateError> {
        Ok(Self::read(path)?.unwrap_or_default())
    }
}

/// The daemon's single writer handle on the record
#[derive(Debug)]
pub struct StateRecordWriter {
    path: PathBuf,
    record: DaemonStateRecord,
}

impl StateRecordWriter {
    /// Start from the previous record so `last_capture` survives restarts
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match DaemonStateRecord::read(&path) {
            Ok(Some(previous)) => DaemonStateRecord {
                listening: false,
                pid: None,
                heartbeat_at: previous.heartbeat_at,
                started_at: None,
                last_capture: previous.last_capture,
                last_capture_at: previous.last_capture_at,
            },
            _ => DaemonStateRecord::default(),
        };
        Self { path, record }
    }

    pub fn record(&self) -> &DaemonStateRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_listening(&mut self, pid: u32) -> Result<(), StateError> {
        let now = Utc::now();
        self.record.listening = true;
        self.record.pid = Some(pid);
        self.record.started_at = Some(now);
        self.record.heartbeat_at = Some(now);
        self.persist()
    }

    pub fn heartbeat(&mut self) -> Result<(), StateError> {
        self.record.heartbeat_at = Some(Utc::now());
        self.persist()
    }

    pub fn record_capture(&mut self, image_path: &Path) -> Result<(), StateError> {
        let now = Utc::now();
        self.record.last_capture = Some(image_path.to_path_buf());
        self.record.last_capture_at = Some(now);
        self.record.heartbeat_at = Some(now);
        self.persist()
    }

    pub fn mark_stopped(&mut self) -> Result<(), StateError> {
        self.record.listening = false;
        self.record.pid = None;
        self.record.heartbeat_at = Some(Utc::now());
        self.persist()
    }

    fn persist(&self) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(&self.record)
            .map_err(|e| StateError::Write(anyhow::Error::new(e)))?;
        atomic_write(&self.path, &json).map_err(StateError::Write)?;
        debug!(listening = self.record.listening, "state record written");
        Ok(())
    }
}
