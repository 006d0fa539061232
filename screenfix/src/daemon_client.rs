// Process control for the capture daemon, used by the tool server
// The tool server never talks to the daemon directly: it spawns it, signals
// it, and watches the state record to confirm what happened.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::{Config, HOME_ENV, PROJECT_DIR_ENV};
use crate::state::DaemonStateRecord;

/// Interval between state record polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Start the daemon in its own session with output appended to the log
///
/// Returns the child pid. The child is reaped on a background thread so a
/// daemon that exits does not linger as a zombie that still answers kill(0).
pub fn spawn_detached(daemon_bin: &Path, config: &Config) -> Result<u32> {
    config
        .ensure_state_dir()
        .context("Failed to create state directory")?;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
        .with_context(|| format!("Failed to open daemon log: {}", config.log_file.display()))?;
    let log_err = log
        .try_clone()
        .context("Failed to duplicate daemon log handle")?;

    let mut command = Command::new(daemon_bin);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .current_dir(&config.project_dir)
        .env(HOME_ENV, &config.state_dir)
        .env(PROJECT_DIR_ENV, &config.project_dir);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own session: no controlling terminal, survives the tool server
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to start daemon at {}", daemon_bin.display()))?;
    let pid = child.id();

    thread::Builder::new()
        .name("daemon-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        })
        .context("Failed to spawn daemon reaper thread")?;

    info!(pid, bin = %daemon_bin.display(), "spawned daemon");
    Ok(pid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// ESRCH: the recorded pid is gone
    NoSuchProcess,
}

/// Ask the daemon to shut down gracefully
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> io::Result<SignalOutcome> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid daemon pid"))?;

    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        debug!(pid, "sent SIGTERM");
        return Ok(SignalOutcome::Delivered);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(SignalOutcome::NoSuchProcess)
    } else {
        Err(err)
    }
}

// TODO(windows): TerminateProcess or a named event
#[cfg(not(unix))]
pub fn send_terminate(_pid: u32) -> io::Result<SignalOutcome> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "stopping the daemon is only supported on Unix",
    ))
}

/// Poll the state record until `done` holds or `timeout` elapses
pub fn wait_for_record<F>(state_file: &Path, timeout: Duration, mut done: F) -> Option<DaemonStateRecord>
where
    F: FnMut(&DaemonStateRecord) -> bool,
{
    let start = Instant::now();
    loop {
        if let Ok(Some(record)) = DaemonStateRecord::read(state_file) {
            if done(&record) {
                return Some(record);
            }
        }
        if start.elapsed() >= timeout {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
