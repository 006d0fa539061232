use super::polling::{wait_for_record, WaitError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_DELAY_MS: u64 = 50;
const MAX_DELAY_MS: u64 = 1_000;

/// Path of the daemon binary cargo built for this test run
pub fn daemon_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_screenfix-daemon"))
}

/// RAII wrapper that ensures the daemon process is cleaned up.
pub struct DaemonGuard {
    child: Child,
    home: PathBuf,
}

impl DaemonGuard {
    /// Start the daemon with `home` as its state dir and `project` as its project dir.
    pub fn start(home: &Path, project: &Path) -> Result<Self, DaemonError> {
        let child = Command::new(daemon_binary())
            .env("SCREENFIX_HOME", home)
            .env("SCREENFIX_PROJECT_DIR", project)
            .env("SCREENFIX_LOG", "debug")
            .current_dir(project)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(DaemonError::SpawnFailed)?;

        let guard = Self {
            child,
            home: home.to_path_buf(),
        };

        println!(
            "Started screenfix-daemon (pid {}) with home {}",
            guard.pid(),
            home.display()
        );

        guard.wait_for_ready().map_err(DaemonError::ReadyTimeout)?;

        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn state_file(&self) -> PathBuf {
        self.home.join("state.json")
    }

    /// Deliver the capture hotkey signal
    #[cfg(unix)]
    pub fn press_hotkey(&self) {
        let rc = unsafe { libc::kill(self.pid() as i32, libc::SIGUSR1) };
        assert_eq!(rc, 0, "failed to signal daemon pid {}", self.pid());
    }

    /// SIGTERM and wait for a clean exit; returns whether it exited in time
    #[cfg(unix)]
    pub fn terminate(&mut self) -> bool {
        unsafe {
            libc::kill(self.pid() as i32, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < STOP_TIMEOUT {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            thread::sleep(Duration::from_millis(INITIAL_DELAY_MS));
        }
        false
    }

    fn wait_for_ready(&self) -> Result<(), WaitError> {
        let pid = self.pid();
        wait_for_record(
            self.state_file(),
            |record| record.listening && record.pid == Some(pid),
            READY_TIMEOUT,
        )
        .map(|_| ())
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        if let Err(err) = self.child.kill() {
            eprintln!(
                "Failed to terminate screenfix-daemon pid {}: {}",
                self.child.id(),
                err
            );
            return;
        }

        let _ = self.child.wait();
    }
}

/// Start the daemon and return a guard that will clean it up on drop.
pub fn start_daemon(home: &Path, project: &Path) -> Result<DaemonGuard, DaemonError> {
    DaemonGuard::start(home, project)
}

/// Wait for a process to exit, used by tests to ensure no orphans remain.
pub fn wait_for_process_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);

    while process_is_running(pid) && start.elapsed() < timeout {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(delay.min(remaining));
        delay = delay
            .checked_mul(2)
            .unwrap_or_else(|| Duration::from_millis(MAX_DELAY_MS))
            .min(Duration::from_millis(MAX_DELAY_MS));
    }

    !process_is_running(pid)
}

pub fn is_process_running(pid: u32) -> bool {
    process_is_running(pid)
}

#[cfg(unix)]
fn process_is_running(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_running(_pid: u32) -> bool {
    false
}

/// Errors that can occur when starting the daemon for tests.
#[derive(Debug)]
pub enum DaemonError {
    SpawnFailed(std::io::Error),
    ReadyTimeout(WaitError),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed(err) => write!(f, "failed to spawn daemon: {}", err),
            Self::ReadyTimeout(err) => write!(f, "daemon never reported listening: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {}
