//! Task Ledger: an append-mostly markdown checklist of annotated screenshots
//!
//! - The daemon appends one pending line per committed capture
//! - The tool server flips `[ ]` to `[x]`, touching nothing else in the file
//! - Every mutation runs under [`LedgerLock`] and lands via temp + rename

pub mod lock;
pub mod markdown;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::persistence::atomic_write;
use lock::{LedgerLock, LockFailure};
use markdown::{
    fold_instruction, format_entry, line_ending, parse_ledger, ParsedEntry, LEDGER_HEADER,
};

pub use markdown::ParseWarning;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("capture image does not exist: {}", .0.display())]
    MissingCapture(PathBuf),
    #[error("instruction is empty")]
    EmptyInstruction,
    #[error("no task matches {0:?}")]
    NotFound(String),
    #[error("ledger is busy: lock still held after {attempts} attempts")]
    WriteConflict { attempts: u32 },
    #[error("ledger I/O error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write ledger: {0:#}")]
    Write(anyhow::Error),
}

impl From<LockFailure> for LedgerError {
    fn from(failure: LockFailure) -> Self {
        match failure {
            LockFailure::Contended { attempts } => LedgerError::WriteConflict { attempts },
            LockFailure::Io { path, source } => LedgerError::Io { path, source },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
}

/// One ledger entry as exposed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    /// 1-based position among entries (file order)
    pub ordinal: usize,
    /// 1-based line number in the ledger file
    pub line: usize,
    /// Capture id of the referenced screenshot
    pub id: String,
    pub status: TaskStatus,
    pub instruction: String,
    pub capture_ref: PathBuf,
}

impl Task {
    fn from_entry(ordinal: usize, entry: &ParsedEntry) -> Self {
        let id = Path::new(&entry.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.file_name.clone());

        Self {
            ordinal,
            line: entry.line,
            id,
            status: if entry.done {
                TaskStatus::Done
            } else {
                TaskStatus::Pending
            },
            instruction: entry.instruction.clone(),
            capture_ref: entry.image_path.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskListing {
    pub tasks: Vec<Task>,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteOutcome {
    pub task: Task,
    pub already_done: bool,
}

/// Handle on a ledger file. Cheap; holds no open file between calls.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw file, `None` if it does not exist yet
    fn read_contents(&self) -> Result<Option<Vec<u8>>, LedgerError> {
        match fs::read(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LedgerError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write_contents(&self, contents: &[u8]) -> Result<(), LedgerError> {
        atomic_write(&self.path, contents).map_err(LedgerError::Write)
    }

    fn ensure_parent(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Add a pending task for an existing capture image
    pub fn append(&self, image_path: &Path, instruction: &str) -> Result<Task, LedgerError> {
        let instruction = fold_instruction(instruction);
        if instruction.is_empty() {
            return Err(LedgerError::EmptyInstruction);
        }
        if !image_path.is_file() {
            return Err(LedgerError::MissingCapture(image_path.to_path_buf()));
        }

        self.ensure_parent()?;
        let _lock = LedgerLock::acquire(&self.path)?;

        let mut contents = self
            .read_contents()?
            .unwrap_or_else(|| format!("{}\n\n", LEDGER_HEADER).into_bytes());
        let eol = line_ending(&contents);
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            contents.extend_from_slice(eol.as_bytes());
        }
        contents.extend_from_slice(format_entry(image_path, &instruction).as_bytes());
        contents.extend_from_slice(eol.as_bytes());

        self.write_contents(&contents)?;

        let parsed = parse_ledger(&contents);
        let task = parsed
            .entries
            .last()
            .map(|entry| Task::from_entry(parsed.entries.len(), entry))
            .ok_or_else(|| LedgerError::NotFound(instruction.clone()))?;

        info!(ordinal = task.ordinal, capture = %task.id, "appended task");
        Ok(task)
    }

    /// Tasks in file order, with warnings for unparseable checkbox lines
    pub fn list_tasks(&self, pending_only: bool) -> Result<TaskListing, LedgerError> {
        let Some(contents) = self.read_contents()? else {
            return Ok(TaskListing::default());
        };

        let parsed = parse_ledger(&contents);
        for warning in &parsed.warnings {
            warn!(
                line = warning.line,
                reason = %warning.reason,
                "skipping unparseable ledger line"
            );
        }

        let tasks = parsed
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| Task::from_entry(i + 1, entry))
            .filter(|task| !pending_only || task.is_pending())
            .collect();

        Ok(TaskListing {
            tasks,
            warnings: parsed.warnings,
        })
    }

    /// Number of pending tasks; 0 when the ledger does not exist
    pub fn pending_count(&self) -> Result<usize, LedgerError> {
        Ok(self.list_tasks(true)?.tasks.len())
    }

    /// Find the task recorded for a capture image
    pub fn task_for_capture(&self, image_path: &Path) -> Result<Option<Task>, LedgerError> {
        let listing = self.list_tasks(false)?;
        Ok(listing
            .tasks
            .into_iter()
            .find(|task| task.capture_ref == image_path))
    }

    /// Mark the selected task done by rewriting only its marker byte
    ///
    /// Selector: ordinal, capture id / file name / image path, or exact
    /// instruction text. Completing a done task is a no-op.
    pub fn complete(&self, selector: &str) -> Result<CompleteOutcome, LedgerError> {
        let not_found = || LedgerError::NotFound(selector.to_string());

        if self.read_contents()?.is_none() {
            return Err(not_found());
        }

        let _lock = LedgerLock::acquire(&self.path)?;
        let mut contents = self.read_contents()?.ok_or_else(not_found)?;
        let parsed = parse_ledger(&contents);

        let index = select_entry(&parsed.entries, selector).ok_or_else(not_found)?;
        let entry = &parsed.entries[index];
        let mut task = Task::from_entry(index + 1, entry);

        if entry.done {
            debug!(ordinal = task.ordinal, "task already done");
            return Ok(CompleteOutcome {
                task,
                already_done: true,
            });
        }

        contents[entry.marker_offset] = b'x';
        self.write_contents(&contents)?;

        task.status = TaskStatus::Done;
        info!(ordinal = task.ordinal, capture = %task.id, "completed task");
        Ok(CompleteOutcome {
            task,
            already_done: false,
        })
    }
}

/// Resolve a selector: ordinal, then capture reference, then exact instruction
fn select_entry(entries: &[ParsedEntry], selector: &str) -> Option<usize> {
    let selector = selector.trim();
    if selector.is_empty() {
        return None;
    }

    if let Ok(ordinal) = selector.parse::<usize>() {
        if (1..=entries.len()).contains(&ordinal) {
            return Some(ordinal - 1);
        }
    }

    let as_path = Path::new(selector);
    let by_capture = entries.iter().position(|e| {
        e.file_name == selector
            || e.image_path == as_path
            || Path::new(&e.file_name).file_stem() == Some(as_path.as_os_str())
    });
    if by_capture.is_some() {
        return by_capture;
    }

    entries
        .iter()
        .position(|e| !e.done && e.instruction == selector)
        .or_else(|| entries.iter().position(|e| e.instruction == selector))
}
