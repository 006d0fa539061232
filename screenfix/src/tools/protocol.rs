// Typed results and errors of the tool handlers
// These are what `structuredContent` carries over the wire.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::ledger::{LedgerError, Task};
use crate::logging::Chain;
use crate::screenshots::{Capture, ImageFormat, StoreError};
use crate::state::StateError;

/// Error codes for tool failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    NotFound,
    WriteConflict,
    AlreadyRunning,
    NotRunning,
    InvalidArguments,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}; retry shortly")]
    WriteConflict(String),
    #[error("{}", already_running_message(.pid, .stale))]
    AlreadyRunning { pid: Option<u32>, stale: bool },
    #[error("{message}")]
    NotRunning { stale: bool, message: String },
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn already_running_message(pid: &Option<u32>, stale: &bool) -> String {
    let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string());
    if *stale {
        format!(
            "state record says the daemon is listening (PID {}) but that process is gone; \
             pass force=true to start a new daemon",
            pid
        )
    } else {
        format!("daemon already running (PID {})", pid)
    }
}

impl ToolError {
    pub fn code(&self) -> ToolErrorCode {
        match self {
            ToolError::NotFound(_) => ToolErrorCode::NotFound,
            ToolError::WriteConflict(_) => ToolErrorCode::WriteConflict,
            ToolError::AlreadyRunning { .. } => ToolErrorCode::AlreadyRunning,
            ToolError::NotRunning { .. } => ToolErrorCode::NotRunning,
            ToolError::InvalidArguments(_) => ToolErrorCode::InvalidArguments,
            ToolError::Internal(_) => ToolErrorCode::Internal,
        }
    }
}

impl From<LedgerError> for ToolError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) | LedgerError::MissingCapture(_) => {
                ToolError::NotFound(err.to_string())
            }
            LedgerError::WriteConflict { .. } => ToolError::WriteConflict(err.to_string()),
            LedgerError::EmptyInstruction => ToolError::InvalidArguments(err.to_string()),
            LedgerError::Io { .. } | LedgerError::Write(_) => {
                ToolError::Internal(Chain(&err).to_string())
            }
        }
    }
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(reference) => ToolError::NotFound(reference),
            other => ToolError::Internal(Chain(&other).to_string()),
        }
    }
}

impl From<StateError> for ToolError {
    fn from(err: StateError) -> Self {
        ToolError::Internal(Chain(&err).to_string())
    }
}

/// get_status result
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub listening: bool,
    pub pid: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_capture: Option<PathBuf>,
    pub state_file: PathBuf,
    pub screenshots_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub screenshot_count: usize,
    pub pending_task_count: usize,
    /// Set when the state record could not be trusted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// start_daemon / stop_daemon result
#[derive(Debug, Clone, Serialize)]
pub struct DaemonTransition {
    pub pid: Option<u32>,
    /// The state record reflected the transition before the poll deadline
    pub confirmed: bool,
    pub message: String,
}

/// Screenshot metadata as listed to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenshotInfo {
    pub id: String,
    pub path: PathBuf,
    pub file_name: String,
    pub captured_at: NaiveDateTime,
    pub format: ImageFormat,
    pub size_bytes: Option<u64>,
}

impl From<&Capture> for ScreenshotInfo {
    fn from(capture: &Capture) -> Self {
        Self {
            id: capture.id.clone(),
            path: capture.image_path.clone(),
            file_name: capture.file_name.clone(),
            captured_at: capture.captured_at,
            format: capture.format,
            size_bytes: std::fs::metadata(&capture.image_path).ok().map(|m| m.len()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotList {
    /// Newest first
    pub screenshots: Vec<ScreenshotInfo>,
    pub total: usize,
}

/// Raw image attached to a result; sent as an image content item, not JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastScreenshot {
    pub screenshot: ScreenshotInfo,
    pub task: Option<Task>,
    #[serde(skip)]
    pub image: Option<ImagePayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotImage {
    pub screenshot: ScreenshotInfo,
    #[serde(skip)]
    pub image: ImagePayload,
}
