//! Capture capabilities: region capture, annotation prompt, clipboard image
//!
//! Each capability is a trait so the pipeline can be driven by scripted
//! fakes in tests. The default implementations shell out to platform tools
//! (`screencapture`/`osascript` on macOS, `gnome-screenshot`/`zenity`/`wl-paste`
//! on Linux); every command line can be replaced from config.json.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::config::Config;

/// Placeholder in a capture command line replaced by the output file path
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(120);
const ANNOTATE_TIMEOUT: Duration = Duration::from_secs(600);
const CLIPBOARD_TIMEOUT: Duration = Duration::from_secs(5);

const PROMPT_TITLE: &str = "Screenfix";
const PROMPT_TEXT: &str = "What should be fixed?";

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture aborted")]
    Aborted,
    #[error("no {0} command available on this platform; set it in config.json")]
    Unsupported(&'static str),
    #[error("empty command line for {0}")]
    EmptyCommand(&'static str),
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("capture I/O error")]
    Io(#[from] io::Error),
}

/// Produces raw image bytes for a user-selected screen region
pub trait CaptureSource: Send {
    fn capture(&mut self) -> Result<Vec<u8>, CaptureError>;
}

/// Result of prompting the user for an instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Submitted(String),
    Cancelled,
}

/// Blocks until the user submits an instruction or cancels
pub trait Annotator: Send {
    fn annotate(&mut self) -> Result<Annotation, CaptureError>;
}

/// Current clipboard image, `None` when the clipboard holds no image
pub trait ClipboardSource: Send {
    fn read_image(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
}

/// The three capabilities the daemon runs with
pub struct Capabilities {
    pub capture: Box<dyn CaptureSource>,
    pub annotator: Box<dyn Annotator>,
    pub clipboard: Box<dyn ClipboardSource>,
}

impl Capabilities {
    /// Command-backed capabilities, honouring command overrides from config
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture: Box::new(CommandCapture::new(
                config
                    .capture_command
                    .clone()
                    .unwrap_or_else(default_capture_command),
            )),
            annotator: Box::new(CommandAnnotator::new(
                config
                    .annotate_command
                    .clone()
                    .unwrap_or_else(default_annotate_command),
            )),
            clipboard: Box::new(CommandClipboard::new(
                config
                    .clipboard_command
                    .clone()
                    .unwrap_or_else(default_clipboard_command),
            )),
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

pub fn default_capture_command() -> Vec<String> {
    if cfg!(target_os = "macos") {
        strings(&["screencapture", "-i", "-x", "-s", OUTPUT_PLACEHOLDER])
    } else if cfg!(target_os = "linux") {
        strings(&["gnome-screenshot", "-a", "-f", OUTPUT_PLACEHOLDER])
    } else {
        Vec::new()
    }
}

pub fn default_annotate_command() -> Vec<String> {
    if cfg!(target_os = "macos") {
        let script = format!(
            "text returned of (display dialog \"{}\" default answer \"\" with title \"{}\" \
             buttons {{\"Cancel\", \"Add Task\"}} default button \"Add Task\")",
            PROMPT_TEXT, PROMPT_TITLE
        );
        vec!["osascript".to_string(), "-e".to_string(), script]
    } else if cfg!(target_os = "linux") {
        vec![
            "zenity".to_string(),
            "--entry".to_string(),
            format!("--title={}", PROMPT_TITLE),
            format!("--text={}", PROMPT_TEXT),
        ]
    } else {
        Vec::new()
    }
}

pub fn default_clipboard_command() -> Vec<String> {
    if cfg!(target_os = "macos") {
        strings(&["osascript", "-e", "the clipboard as «class PNGf»"])
    } else if cfg!(target_os = "linux") {
        strings(&["wl-paste", "--no-newline", "--type", "image/png"])
    } else {
        Vec::new()
    }
}

/// Finished command with captured output
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run a command to completion, killing it after `timeout`
///
/// Output pipes are drained on their own threads so a child writing a large
/// image to stdout cannot block on a full pipe while we wait.
pub fn run_command(
    argv: &[String],
    timeout: Duration,
    what: &'static str,
) -> Result<CommandOutput, CaptureError> {
    let (program, args) = argv.split_first().ok_or(CaptureError::EmptyCommand(what))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CaptureError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::TimedOut {
                program: program.clone(),
                timeout,
            });
        }
    };

    let stdout = stdout_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    debug!(program = %program, code = ?status.code(), "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
    })
}

/// Region capture through an external tool writing to `{output}`
#[derive(Debug, Clone)]
pub struct CommandCapture {
    argv: Vec<String>,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl CommandCapture {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: CAPTURE_TIMEOUT,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn scratch_path(&self) -> PathBuf {
        self.scratch_dir.join(format!(
            ".screenfix-capture-{}-{}.png",
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }
}

impl CaptureSource for CommandCapture {
    fn capture(&mut self) -> Result<Vec<u8>, CaptureError> {
        if self.argv.is_empty() {
            return Err(CaptureError::Unsupported("capture"));
        }

        let scratch = self.scratch_path();
        let scratch_str = scratch.to_string_lossy();
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|arg| arg.replace(OUTPUT_PLACEHOLDER, &scratch_str))
            .collect();

        let result = run_command(&argv, self.timeout, "capture");
        let bytes = std::fs::read(&scratch).ok();
        let _ = std::fs::remove_file(&scratch);
        let output = result?;

        match bytes {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            // The tools exit cleanly and write nothing when the user presses Esc
            _ if output.status.success() => Err(CaptureError::Aborted),
            _ => Err(CaptureError::CommandFailed {
                program: argv[0].clone(),
                status: output.status,
                stderr: output.stderr,
            }),
        }
    }
}

/// Instruction prompt through an external dialog printing the text on stdout
#[derive(Debug, Clone)]
pub struct CommandAnnotator {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandAnnotator {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: ANNOTATE_TIMEOUT,
        }
    }
}

impl Annotator for CommandAnnotator {
    fn annotate(&mut self) -> Result<Annotation, CaptureError> {
        if self.argv.is_empty() {
            return Err(CaptureError::Unsupported("annotate"));
        }

        let output = match run_command(&self.argv, self.timeout, "annotate") {
            Ok(output) => output,
            Err(CaptureError::TimedOut { .. }) => {
                warn!("annotation prompt timed out, treating as cancelled");
                return Ok(Annotation::Cancelled);
            }
            Err(e) => return Err(e),
        };

        if !output.status.success() {
            return Ok(Annotation::Cancelled);
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            Ok(Annotation::Cancelled)
        } else {
            Ok(Annotation::Submitted(text))
        }
    }
}

/// Clipboard image through an external tool printing it on stdout
#[derive(Debug, Clone)]
pub struct CommandClipboard {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandClipboard {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            timeout: CLIPBOARD_TIMEOUT,
        }
    }
}

impl ClipboardSource for CommandClipboard {
    fn read_image(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if self.argv.is_empty() {
            return Err(CaptureError::Unsupported("clipboard"));
        }

        let output = run_command(&self.argv, self.timeout, "clipboard")?;
        // Both osascript and wl-paste exit non-zero when there is no image
        if !output.status.success() || output.stdout.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            decode_applescript_data(&output.stdout).unwrap_or(output.stdout),
        ))
    }
}

/// Decode AppleScript's `«data PNGf89504E47...»` rendering of binary data
pub fn decode_applescript_data(stdout: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(stdout).ok()?.trim();
    let body = text.strip_prefix("«data ")?.strip_suffix('»')?;
    // Four-character type code (PNGf, TIFF, ...) precedes the hex payload
    let hex_payload = body.get(4..)?;
    hex::decode(hex_payload).ok()
}
