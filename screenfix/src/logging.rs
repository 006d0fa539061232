// Tracing setup shared by both binaries

use std::error::Error;
use std::fmt;

use tracing_subscriber::EnvFilter;

/// Filter directives, e.g. `SCREENFIX_LOG=screenfix_lib=debug`
pub const LOG_ENV: &str = "SCREENFIX_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber on stderr
///
/// stdout stays free for the JSON-RPC channel. Calling this twice is harmless.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .try_init()
        .ok();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Renders an error and its `source()` causes as `outer: inner: ...`
pub struct Chain<'a>(pub &'a dyn Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {}", cause)?;
            source = cause.source();
        }
        Ok(())
    }
}
