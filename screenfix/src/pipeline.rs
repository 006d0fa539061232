//! Capture Pipeline: trigger → capture → annotate → commit
//!
//! One cycle is one logical transaction. Nothing touches disk until the user
//! submits an instruction; then the image is written first and the ledger
//! line second, so a ledger entry never points at a missing image.

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capture::{Annotation, Annotator, CaptureError, CaptureSource};
use crate::ledger::markdown::fold_instruction;
use crate::ledger::{Ledger, Task};
use crate::logging::Chain;
use crate::screenshots::{Capture, ScreenshotStore};
use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Capturing,
    Annotating,
    Committing,
}

/// How a cycle ended
#[derive(Debug)]
pub enum CycleOutcome {
    /// Image saved and task appended
    Committed { capture: Capture, task: Task },
    /// User cancelled or submitted nothing; no writes happened
    Cancelled,
    /// No image was obtained; no writes happened
    CaptureFailed { reason: String },
    /// The image could not be saved; no ledger append was attempted
    SaveFailed { reason: String },
    /// Image saved but the ledger append failed
    Orphaned { capture: Capture, reason: String },
}

impl CycleOutcome {
    /// The capture that now exists in the store, if any
    pub fn saved_capture(&self) -> Option<&Capture> {
        match self {
            CycleOutcome::Committed { capture, .. } | CycleOutcome::Orphaned { capture, .. } => {
                Some(capture)
            }
            _ => None,
        }
    }
}

pub struct CapturePipeline {
    store: ScreenshotStore,
    ledger: Ledger,
    capture: Box<dyn CaptureSource>,
    annotator: Box<dyn Annotator>,
    state: PipelineState,
}

impl CapturePipeline {
    pub fn new(
        store: ScreenshotStore,
        ledger: Ledger,
        capture: Box<dyn CaptureSource>,
        annotator: Box<dyn Annotator>,
    ) -> Self {
        Self {
            store,
            ledger,
            capture,
            annotator,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run one full cycle. Always returns to `Idle`.
    pub fn run_cycle(&mut self, trigger: Trigger) -> CycleOutcome {
        debug!(trigger = trigger.kind(), "capture cycle started");
        let outcome = self.drive(trigger);
        self.state = PipelineState::Idle;
        outcome
    }

    fn drive(&mut self, trigger: Trigger) -> CycleOutcome {
        self.state = PipelineState::Capturing;
        let image = match trigger {
            Trigger::Hotkey => match self.capture.capture() {
                Ok(image) => image,
                Err(CaptureError::Aborted) => {
                    info!("capture aborted by user");
                    return CycleOutcome::CaptureFailed {
                        reason: "aborted".to_string(),
                    };
                }
                Err(e) => {
                    warn!("capture failed: {}", Chain(&e));
                    return CycleOutcome::CaptureFailed {
                        reason: Chain(&e).to_string(),
                    };
                }
            },
            Trigger::Clipboard(image) => image,
        };
        if image.is_empty() {
            warn!("capture produced no image data");
            return CycleOutcome::CaptureFailed {
                reason: "empty image".to_string(),
            };
        }

        self.state = PipelineState::Annotating;
        let instruction = match self.annotator.annotate() {
            Ok(Annotation::Submitted(text)) => fold_instruction(&text),
            Ok(Annotation::Cancelled) => String::new(),
            Err(e) => {
                warn!("annotation prompt failed: {}", Chain(&e));
                String::new()
            }
        };
        if instruction.is_empty() {
            info!("annotation cancelled, discarding capture");
            return CycleOutcome::Cancelled;
        }

        self.state = PipelineState::Committing;
        let capture = match self.store.save(&image) {
            Ok(capture) => capture,
            Err(e) => {
                error!("failed to save screenshot: {}", Chain(&e));
                return CycleOutcome::SaveFailed {
                    reason: Chain(&e).to_string(),
                };
            }
        };

        match self.ledger.append(&capture.image_path, &instruction) {
            Ok(task) => {
                info!(
                    capture = %capture.id,
                    ordinal = task.ordinal,
                    "captured screenshot with task"
                );
                CycleOutcome::Committed { capture, task }
            }
            Err(e) => {
                warn!(
                    path = %capture.image_path.display(),
                    "screenshot saved but task was not recorded: {}", Chain(&e)
                );
                CycleOutcome::Orphaned {
                    capture,
                    reason: Chain(&e).to_string(),
                }
            }
        }
    }
}
