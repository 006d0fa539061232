//! Test utilities for async daemon tests
//!
//! Only compiled in test builds. Polling with a deadline instead of fixed
//! `tokio::time::sleep()` values keeps the daemon tests from flaking.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry `f` every `interval` until it returns `Ok`, panicking after `timeout`
///
/// # Example
///
/// ```rust,ignore
/// let record = assert_eventually(
///     "daemon to report listening",
///     Duration::from_secs(3),
///     Duration::from_millis(20),
///     || async {
///         let record = DaemonStateRecord::read_or_default(&config.state_file).unwrap();
///         if record.listening { Ok(record) } else { Err("not listening yet") }
///     },
/// )
/// .await;
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, e
                    );
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_assert_eventually_returns_value() {
        let value = assert_eventually(
            "immediate success",
            Duration::from_secs(1),
            Duration::from_millis(50),
            || async { Ok::<_, &str>(42) },
        )
        .await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_assert_eventually_retries() {
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_clone = Arc::clone(&polls);

        let seen = assert_eventually(
            "third poll",
            Duration::from_secs(2),
            Duration::from_millis(10),
            move || {
                let polls = Arc::clone(&polls_clone);
                async move {
                    let n = polls.fetch_add(1, Ordering::SeqCst);
                    if n >= 2 {
                        Ok(n)
                    } else {
                        Err(format!("only {} polls", n))
                    }
                }
            },
        )
        .await;

        assert_eq!(seen, 2);
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for never succeeds")]
    async fn test_assert_eventually_times_out() {
        assert_eventually(
            "never succeeds",
            Duration::from_millis(100),
            Duration::from_millis(20),
            || async { Err::<(), _>("always fails") },
        )
        .await;
    }
}
