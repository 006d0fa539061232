//! Capture daemon event loop
//!
//! Single tokio loop owning the state record writer. Triggers come in over a
//! channel; each accepted trigger moves the pipeline onto a blocking worker
//! and the loop keeps heartbeating until the worker hands it back.

use std::future::Future;
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capture::ClipboardSource;
use crate::config::Config;
use crate::logging::Chain;
use crate::pipeline::{CapturePipeline, CycleOutcome};
use crate::screenshots::ScreenshotStore;
use crate::state::{DaemonStateRecord, Liveness, StateError, StateRecordWriter, SystemProbe};
use crate::trigger::{ClipboardWatcher, Trigger};

/// Buffered triggers; anything beyond this while busy is dropped anyway
const TRIGGER_QUEUE: usize = 8;

pub fn trigger_channel() -> (mpsc::Sender<Trigger>, mpsc::Receiver<Trigger>) {
    mpsc::channel(TRIGGER_QUEUE)
}

/// Refuse to start when the record names another live daemon
///
/// An unparseable record names nobody; `mark_listening` overwrites it.
pub fn check_single_instance(config: &Config) -> Result<()> {
    let record = match DaemonStateRecord::read_or_default(&config.state_file) {
        Ok(record) => record,
        Err(e @ StateError::Parse { .. }) => {
            warn!("ignoring unreadable state record: {}", Chain(&e));
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to read daemon state record"),
    };

    match record.liveness(&SystemProbe) {
        Liveness::Listening { pid } if pid != std::process::id() => {
            anyhow::bail!("Daemon already running (PID: {})", pid)
        }
        Liveness::Stale { pid } => {
            info!(?pid, "previous daemon did not shut down cleanly");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Forward SIGUSR1 as hotkey triggers
///
/// The handler is installed before this returns, so the default SIGUSR1
/// action (terminate) can no longer hit the daemon.
#[cfg(unix)]
pub fn spawn_hotkey_listener(tx: mpsc::Sender<Trigger>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            debug!("hotkey signal received");
            if tx.try_send(Trigger::Hotkey).is_err() {
                debug!("trigger queue full or closed, dropping hotkey");
            }
        }
    });
    Ok(())
}

/// Poll the clipboard on a dedicated thread; clipboard tools block
pub fn spawn_clipboard_watcher(
    source: Box<dyn ClipboardSource>,
    interval: std::time::Duration,
    tx: mpsc::Sender<Trigger>,
) -> Result<()> {
    thread::Builder::new()
        .name("clipboard-watcher".to_string())
        .spawn(move || {
            let mut watcher = ClipboardWatcher::new(source);
            loop {
                if let Some(trigger) = watcher.poll() {
                    match tx.try_send(trigger) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!("trigger queue full, dropping clipboard image")
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                if tx.is_closed() {
                    break;
                }
                thread::sleep(interval);
            }
        })
        .context("Failed to spawn clipboard watcher thread")?;
    Ok(())
}

/// Resolves on SIGTERM or SIGINT
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run the daemon until `shutdown` resolves
///
/// Writes `listening=true` on entry and `listening=false` on the way out.
/// An in-flight cycle is abandoned at shutdown, not awaited.
pub async fn run(
    config: &Config,
    pipeline: CapturePipeline,
    mut triggers: mpsc::Receiver<Trigger>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    config
        .ensure_state_dir()
        .context("Failed to create state directory")?;
    config
        .ensure_project_dirs()
        .context("Failed to create screenshot and task directories")?;

    let store = ScreenshotStore::new(&config.screenshots_dir);
    match store.cleanup_stale_temps() {
        Ok((deleted, _, _)) if deleted > 0 => info!(deleted, "removed stale temp files"),
        Ok(_) => {}
        Err(e) => warn!("stale temp cleanup failed: {}", Chain(&e)),
    }

    let mut state = StateRecordWriter::open(&config.state_file);
    state
        .mark_listening(std::process::id())
        .context("Failed to write daemon state record")?;
    info!(
        pid = std::process::id(),
        trigger = %config.trigger,
        screenshots = %config.screenshots_dir.display(),
        tasks = %config.tasks_file.display(),
        "daemon listening"
    );

    let (done_tx, mut done_rx) = mpsc::channel::<(CapturePipeline, CycleOutcome)>(1);
    let mut idle_pipeline = Some(pipeline);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down daemon");
                break;
            }

            trigger = triggers.recv() => {
                let Some(trigger) = trigger else {
                    info!("trigger sources closed");
                    break;
                };
                let Some(mut pipeline) = idle_pipeline.take() else {
                    debug!(trigger = trigger.kind(), "cycle in flight, dropping trigger");
                    continue;
                };
                let done_tx = done_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let outcome = pipeline.run_cycle(trigger);
                    let _ = done_tx.blocking_send((pipeline, outcome));
                });
            }

            Some((pipeline, outcome)) = done_rx.recv() => {
                idle_pipeline = Some(pipeline);
                let result = match outcome.saved_capture() {
                    Some(capture) => state.record_capture(&capture.image_path),
                    None => state.heartbeat(),
                };
                if let Err(e) = result {
                    warn!("failed to update state record: {}", Chain(&e));
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = state.heartbeat() {
                    warn!("heartbeat failed: {}", Chain(&e));
                }
            }
        }
    }

    state
        .mark_stopped()
        .context("Failed to mark daemon stopped")?;
    info!("daemon stopped");
    Ok(())
}
