//! Tool Server handlers
//!
//! Stateless operations over the three on-disk stores. Only `complete_task`,
//! `start_daemon` and `stop_daemon` change shared state; everything else is a
//! read. `mcp` exposes these handlers over JSON-RPC on stdio.

pub mod mcp;
pub mod protocol;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::cli_paths::resolve_daemon_path;
use crate::config::Config;
use crate::daemon_client::{self, SignalOutcome};
use crate::ledger::{CompleteOutcome, Ledger, TaskListing};
use crate::logging::Chain;
use crate::screenshots::ScreenshotStore;
use crate::state::{DaemonStateRecord, Liveness, ProcessProbe, StateError, SystemProbe};
use protocol::{
    DaemonTransition, ImagePayload, LastScreenshot, ScreenshotImage, ScreenshotInfo,
    ScreenshotList, StatusReport, ToolError,
};

pub const DEFAULT_LIST_LIMIT: usize = 10;

/// How long start/stop wait for the state record to confirm
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ToolServer {
    config: Config,
    store: ScreenshotStore,
    ledger: Ledger,
    probe: Box<dyn ProcessProbe + Send>,
    daemon_bin: Option<PathBuf>,
    confirm_timeout: Duration,
}

impl ToolServer {
    pub fn new(config: Config) -> Self {
        Self {
            store: ScreenshotStore::new(&config.screenshots_dir),
            ledger: Ledger::new(&config.tasks_file),
            probe: Box::new(SystemProbe),
            daemon_bin: None,
            confirm_timeout: CONFIRM_TIMEOUT,
            config,
        }
    }

    /// Use this daemon binary instead of discovering one
    pub fn with_daemon_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.daemon_bin = Some(path.into());
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn ProcessProbe + Send>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The record, or "stopped" plus a warning when the file is unparseable
    fn read_record(&self) -> Result<(DaemonStateRecord, Option<String>), ToolError> {
        match DaemonStateRecord::read_or_default(&self.config.state_file) {
            Ok(record) => Ok((record, None)),
            Err(e @ StateError::Parse { .. }) => {
                let warning = format!("{}; treating the daemon as stopped", Chain(&e));
                warn!("{}", warning);
                Ok((DaemonStateRecord::default(), Some(warning)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The record as written, plus store counts. No liveness probe.
    pub fn get_status(&self) -> Result<StatusReport, ToolError> {
        let (record, warning) = self.read_record()?;
        let screenshot_count = self.store.list()?.len();
        let pending_task_count = self.ledger.pending_count()?;

        Ok(StatusReport {
            listening: record.listening,
            pid: record.pid.filter(|_| record.listening),
            heartbeat_at: record.heartbeat_at,
            started_at: record.started_at,
            last_capture: record.last_capture,
            state_file: self.config.state_file.clone(),
            screenshots_dir: self.config.screenshots_dir.clone(),
            tasks_file: self.config.tasks_file.clone(),
            screenshot_count,
            pending_task_count,
            warning,
        })
    }

    /// Spawn the daemon unless the record says one is listening
    ///
    /// A stale record (dead pid) only blocks the start until `force` is set.
    pub fn start_daemon(&self, force: bool) -> Result<DaemonTransition, ToolError> {
        let (record, _) = self.read_record()?;
        match record.liveness(self.probe.as_ref()) {
            Liveness::Listening { pid } => {
                return Err(ToolError::AlreadyRunning {
                    pid: Some(pid),
                    stale: false,
                })
            }
            Liveness::Stale { pid } if !force => {
                return Err(ToolError::AlreadyRunning { pid, stale: true })
            }
            Liveness::Stale { pid } => {
                warn!(?pid, "starting daemon over a stale state record");
            }
            Liveness::Stopped => {}
        }

        let daemon_bin = self
            .daemon_bin
            .clone()
            .or_else(resolve_daemon_path)
            .ok_or_else(|| {
                ToolError::Internal(
                    "could not find the screenfix-daemon binary; set SCREENFIX_DAEMON_BIN"
                        .to_string(),
                )
            })?;

        let pid = daemon_client::spawn_detached(&daemon_bin, &self.config)
            .map_err(|e| ToolError::Internal(format!("{:#}", e)))?;

        let confirmed = daemon_client::wait_for_record(
            &self.config.state_file,
            self.confirm_timeout,
            |record| record.listening && record.pid == Some(pid),
        )
        .is_some();

        let message = if confirmed {
            format!("Daemon started (PID {})", pid)
        } else {
            format!(
                "Daemon spawned (PID {}) but did not report listening within {}s; see {}",
                pid,
                self.confirm_timeout.as_secs(),
                self.config.log_file.display()
            )
        };
        info!(pid, confirmed, "start_daemon");

        Ok(DaemonTransition {
            pid: Some(pid),
            confirmed,
            message,
        })
    }

    /// Send SIGTERM to the recorded daemon and wait for `listening=false`
    pub fn stop_daemon(&self) -> Result<DaemonTransition, ToolError> {
        let (record, _) = self.read_record()?;
        if !record.listening {
            return Err(ToolError::NotRunning {
                stale: false,
                message: "daemon is not running".to_string(),
            });
        }

        let Some(pid) = record.pid else {
            return Err(ToolError::NotRunning {
                stale: true,
                message: "state record says listening but has no PID (stale record)".to_string(),
            });
        };

        match daemon_client::send_terminate(pid) {
            Ok(SignalOutcome::Delivered) => {}
            Ok(SignalOutcome::NoSuchProcess) => {
                return Err(ToolError::NotRunning {
                    stale: true,
                    message: format!(
                        "daemon PID {} no longer exists (stale state record)",
                        pid
                    ),
                })
            }
            Err(e) => {
                return Err(ToolError::Internal(format!(
                    "failed to signal daemon PID {}: {}",
                    pid, e
                )))
            }
        }

        let confirmed = daemon_client::wait_for_record(
            &self.config.state_file,
            self.confirm_timeout,
            |record| !record.listening,
        )
        .is_some();

        let message = if confirmed {
            format!("Daemon stopped (PID {})", pid)
        } else {
            format!(
                "Sent SIGTERM to PID {} but the daemon has not confirmed shutdown yet",
                pid
            )
        };
        info!(pid, confirmed, "stop_daemon");

        Ok(DaemonTransition {
            pid: Some(pid),
            confirmed,
            message,
        })
    }

    /// Most recent screenshots first
    pub fn list_screenshots(&self, limit: Option<usize>) -> Result<ScreenshotList, ToolError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        let captures = self.store.list()?;
        let total = captures.len();

        let screenshots = captures
            .iter()
            .rev()
            .take(limit)
            .map(ScreenshotInfo::from)
            .collect();

        Ok(ScreenshotList { screenshots, total })
    }

    /// Latest screenshot with its task and, optionally, its bytes
    pub fn get_last_screenshot(&self, include_image: bool) -> Result<LastScreenshot, ToolError> {
        let capture = self
            .store
            .latest()?
            .ok_or_else(|| ToolError::NotFound("no screenshots yet".to_string()))?;

        let task = self.ledger.task_for_capture(&capture.image_path)?;
        let image = if include_image {
            Some(ImagePayload {
                format: capture.format,
                bytes: self.store.read(&capture.file_name)?,
            })
        } else {
            None
        };

        Ok(LastScreenshot {
            screenshot: ScreenshotInfo::from(&capture),
            task,
            image,
        })
    }

    pub fn get_tasks(&self, pending_only: bool) -> Result<TaskListing, ToolError> {
        Ok(self.ledger.list_tasks(pending_only)?)
    }

    pub fn complete_task(&self, task_id: &str) -> Result<CompleteOutcome, ToolError> {
        if task_id.trim().is_empty() {
            return Err(ToolError::InvalidArguments(
                "task_id must not be empty".to_string(),
            ));
        }
        Ok(self.ledger.complete(task_id)?)
    }

    /// Bytes of a stored screenshot; paths outside the store are not served
    pub fn read_screenshot(&self, path: &str) -> Result<ScreenshotImage, ToolError> {
        let capture = self.store.resolve(path)?;
        let bytes = self.store.read(&capture.file_name)?;

        Ok(ScreenshotImage {
            screenshot: ScreenshotInfo::from(&capture),
            image: ImagePayload {
                format: capture.format,
                bytes,
            },
        })
    }
}
