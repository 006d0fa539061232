// screenfix-daemon: background screenshot capture daemon
//
// Responsibilities:
// - Listen for the capture hotkey (SIGUSR1) or clipboard images
// - Run capture -> annotate -> commit, one cycle at a time
// - Save screenshots and append tasks to the project's task file
// - Keep state.json current so the tool server can report on it

use std::time::Duration;

use anyhow::{Context, Result};
use screenfix_lib::capture::Capabilities;
use screenfix_lib::config::{Config, TriggerMode};
use screenfix_lib::daemon;
use screenfix_lib::ledger::Ledger;
use screenfix_lib::logging;
use screenfix_lib::pipeline::CapturePipeline;
use screenfix_lib::screenshots::ScreenshotStore;
use tracing::info;

/// Grace period for blocking workers (an open annotation dialog) at exit
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    logging::init();

    let config = Config::from_env().context("Failed to load configuration")?;
    daemon::check_single_instance(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(run(config));

    // A cycle stuck in a dialog must not hold the process open
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run(config: Config) -> Result<()> {
    let capabilities = Capabilities::from_config(&config);
    let (tx, rx) = daemon::trigger_channel();

    #[cfg(unix)]
    daemon::spawn_hotkey_listener(tx.clone())?;

    if config.trigger == TriggerMode::Clipboard {
        info!(
            interval_ms = config.clipboard_poll_interval.as_millis() as u64,
            "watching clipboard for images"
        );
        daemon::spawn_clipboard_watcher(
            capabilities.clipboard,
            config.clipboard_poll_interval,
            tx.clone(),
        )?;
    }

    let pipeline = CapturePipeline::new(
        ScreenshotStore::new(&config.screenshots_dir),
        Ledger::new(&config.tasks_file),
        capabilities.capture,
        capabilities.annotator,
    );

    // `tx` stays alive so the loop only ends on a shutdown signal
    let result = daemon::run(&config, pipeline, rx, daemon::shutdown_signal()).await;
    drop(tx);
    result
}
