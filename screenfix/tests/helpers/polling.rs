use screenfix_lib::state::DaemonStateRecord;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const FIRST_POLL: Duration = Duration::from_millis(25);
const MAX_POLL: Duration = Duration::from_millis(400);

/// A file the daemon writes never reached the expected state
#[derive(Debug)]
pub struct WaitError {
    path: PathBuf,
    waited: Duration,
    last_seen: String,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gave up on {} after {:?}; last seen: {}",
            self.path.display(),
            self.waited,
            self.last_seen
        )
    }
}

impl std::error::Error for WaitError {}

/// Re-run `check` until it yields a value, backing off up to `MAX_POLL`
///
/// `check` returns a description of what it saw when not ready yet.
fn poll<T>(
    path: &Path,
    timeout: Duration,
    mut check: impl FnMut() -> Result<T, String>,
) -> Result<T, WaitError> {
    let start = Instant::now();
    let mut interval = FIRST_POLL;

    loop {
        let last_seen = match check() {
            Ok(value) => return Ok(value),
            Err(seen) => seen,
        };

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(WaitError {
                path: path.to_path_buf(),
                waited: start.elapsed(),
                last_seen,
            });
        }
        thread::sleep(interval.min(remaining));
        interval = (interval * 2).min(MAX_POLL);
    }
}

/// Wait until the daemon's state record satisfies `ready`
///
/// A missing or half-written record counts as not ready.
pub fn wait_for_record<F>(
    path: impl AsRef<Path>,
    ready: F,
    timeout: Duration,
) -> Result<DaemonStateRecord, WaitError>
where
    F: Fn(&DaemonStateRecord) -> bool,
{
    let path = path.as_ref();
    poll(path, timeout, || match DaemonStateRecord::read(path) {
        Ok(Some(record)) if ready(&record) => Ok(record),
        Ok(Some(record)) => Err(format!("{:?}", record)),
        Ok(None) => Err("no record yet".to_string()),
        Err(e) => Err(e.to_string()),
    })
}

/// Wait until a text file has at least `count` lines; returns the line count
pub fn wait_for_lines(
    path: impl AsRef<Path>,
    count: usize,
    timeout: Duration,
) -> Result<usize, WaitError> {
    let path = path.as_ref();
    poll(path, timeout, || {
        let lines = std::fs::read_to_string(path)
            .map(|text| text.lines().count())
            .unwrap_or(0);
        if lines >= count {
            Ok(lines)
        } else {
            Err(format!("{} of {} lines", lines, count))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn wait_for_record_skips_partial_writes() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("state.json");
        fs::write(&file, "{\"listening\": ").unwrap();

        let err = wait_for_record(&file, |_| true, Duration::from_millis(1)).unwrap_err();
        assert!(err.to_string().contains("state.json"), "{}", err);

        fs::write(&file, r#"{"listening": true, "pid": 9}"#).unwrap();
        let record = wait_for_record(&file, |r| r.listening, Duration::from_secs(1))
            .expect("complete record is accepted");
        assert_eq!(record.pid, Some(9));
    }

    #[test]
    fn wait_for_record_reports_last_record_on_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("state.json");
        fs::write(&file, r#"{"listening": false}"#).unwrap();

        let err = wait_for_record(&file, |r| r.listening, Duration::from_millis(30)).unwrap_err();
        assert!(err.to_string().contains("listening: false"), "{}", err);
    }

    #[test]
    fn wait_for_lines_counts_appended_lines() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("prompts.log");

        let err = wait_for_lines(&file, 1, Duration::from_millis(1)).unwrap_err();
        assert!(err.to_string().contains("0 of 1 lines"), "{}", err);

        fs::write(&file, "prompt\nprompt\n").unwrap();
        assert_eq!(wait_for_lines(&file, 2, Duration::from_secs(1)).unwrap(), 2);
    }
}
