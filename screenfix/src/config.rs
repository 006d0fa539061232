// Environment configuration for the daemon and the tool server
// Resolves the per-user state dir, the project-relative stores and the
// user settings file (config.json)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the per-user state dir (state.json, config.json, daemon.log)
pub const HOME_ENV: &str = "SCREENFIX_HOME";
/// Overrides the project dir that relative store paths resolve against
pub const PROJECT_DIR_ENV: &str = "SCREENFIX_PROJECT_DIR";
/// Overrides daemon binary discovery for the tool server
pub const DAEMON_BIN_ENV: &str = "SCREENFIX_DAEMON_BIN";

const DEFAULT_SAVE_DIRECTORY: &str = "./screenfix/screenshots";
const DEFAULT_TASKS_FILE: &str = "./screenfix/tasks/screenfix-tasks.md";
const DEFAULT_HEARTBEAT_SECS: u64 = 5;
const DEFAULT_CLIPBOARD_POLL_MS: u64 = 300;

/// How the daemon learns that the user wants a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// SIGUSR1 sent by a system hotkey binding
    #[default]
    Signal,
    /// A new image showed up on the system clipboard
    Clipboard,
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerMode::Signal => write!(f, "signal"),
            TriggerMode::Clipboard => write!(f, "clipboard"),
        }
    }
}

/// User settings persisted in config.json. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboard_poll_interval_ms: Option<u64>,
    /// Command line for region capture; `{output}` is replaced by the target path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_command: Option<Vec<String>>,
    /// Command line printing the instruction on stdout; non-zero exit = cancelled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotate_command: Option<Vec<String>>,
    /// Command line printing the clipboard image (raw bytes or AppleScript hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboard_command: Option<Vec<String>>,
}

impl Settings {
    /// Load settings, treating a missing or empty file as defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings file: {}", path.display()))
            }
        };

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }
}

/// Resolved paths and tunables shared by both processes
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-user directory (state record, settings, daemon log)
    pub state_dir: PathBuf,
    /// Directory relative store paths resolve against
    pub project_dir: PathBuf,
    /// Daemon state record
    pub state_file: PathBuf,
    /// User settings file
    pub settings_file: PathBuf,
    /// Daemon stdout/stderr when started by the tool server
    pub log_file: PathBuf,
    /// Screenshot Store directory
    pub screenshots_dir: PathBuf,
    /// Task Ledger file
    pub tasks_file: PathBuf,
    pub trigger: TriggerMode,
    pub heartbeat_interval: Duration,
    pub clipboard_poll_interval: Duration,
    pub capture_command: Option<Vec<String>>,
    pub annotate_command: Option<Vec<String>>,
    pub clipboard_command: Option<Vec<String>>,
}

impl Config {
    /// Build a config rooted at explicit directories with default settings
    pub fn with_dirs(state_dir: &Path, project_dir: &Path) -> Self {
        Self::from_settings(state_dir.to_path_buf(), project_dir, Settings::default())
    }

    /// Create configuration from environment variables and config.json
    pub fn from_env() -> Result<Self> {
        let state_dir = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_state_dir);

        let project_dir = match std::env::var_os(PROJECT_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };

        let settings = Settings::load(&state_dir.join("config.json"))?;
        Ok(Self::from_settings(state_dir, &project_dir, settings))
    }

    fn from_settings(state_dir: PathBuf, project_dir: &Path, settings: Settings) -> Self {
        let save_directory = settings
            .save_directory
            .as_deref()
            .unwrap_or(DEFAULT_SAVE_DIRECTORY);
        let tasks_file = settings.tasks_file.as_deref().unwrap_or(DEFAULT_TASKS_FILE);

        Self {
            state_file: state_dir.join("state.json"),
            settings_file: state_dir.join("config.json"),
            log_file: state_dir.join("daemon.log"),
            screenshots_dir: resolve_path(project_dir, save_directory),
            tasks_file: resolve_path(project_dir, tasks_file),
            trigger: settings.trigger.unwrap_or_default(),
            heartbeat_interval: Duration::from_secs(
                settings
                    .heartbeat_interval_secs
                    .unwrap_or(DEFAULT_HEARTBEAT_SECS)
                    .max(1),
            ),
            clipboard_poll_interval: Duration::from_millis(
                settings
                    .clipboard_poll_interval_ms
                    .unwrap_or(DEFAULT_CLIPBOARD_POLL_MS)
                    .max(50),
            ),
            capture_command: settings.capture_command,
            annotate_command: settings.annotate_command,
            clipboard_command: settings.clipboard_command,
            project_dir: project_dir.to_path_buf(),
            state_dir,
        }
    }

    /// Default per-user state directory: ~/.config/screenfix
    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".config").join("screenfix"))
            .unwrap_or_else(|| PathBuf::from("/tmp/screenfix"))
    }

    /// Ensure the state dir exists with owner-only permissions on Unix
    pub fn ensure_state_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.state_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    /// Ensure the screenshot dir and the ledger's parent dir exist
    pub fn ensure_project_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.screenshots_dir)?;
        if let Some(parent) = self.tasks_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Expand `~` and resolve relative paths against `base`
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None if raw == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    };

    if expanded.is_absolute() {
        expanded
    } else {
        let stripped = expanded
            .strip_prefix(".")
            .map(Path::to_path_buf)
            .unwrap_or(expanded);
        base.join(stripped)
    }
}
