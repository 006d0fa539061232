// Markdown checklist format for the task ledger
//
// Entry format: - [ ] [<file name>](<<image path>>) <instruction>
// Example: - [ ] [screenshot_20261018_101500.png](</p/shots/screenshot_20261018_101500.png>) Fix button alignment
//
// Anything that is not a checkbox line is left alone. Checkbox-looking lines
// that do not parse, and lines that are not UTF-8, come back as warnings
// instead of failing the whole file.

use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const LEDGER_HEADER: &str = "# Screenfix Tasks";

/// Any line that starts like a list checkbox
static CANDIDATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\[").unwrap());

/// Captures: (prefix)(marker)(rest)
static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*[-*]\s+)\[(.)\](.*)$").unwrap());

/// Captures: (file name)(angle-bracket destination | bare destination)(instruction)
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[([^\]]+)\]\((?:<([^>]+)>|([^\s)]+))\)\s*(.*)$").unwrap()
});

/// A well-formed ledger entry with its position in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    /// 1-based line number
    pub line: usize,
    pub done: bool,
    pub file_name: String,
    pub image_path: PathBuf,
    pub instruction: String,
    /// Byte offset of the marker character in the whole file
    pub marker_offset: usize,
}

/// A checkbox line that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedLedger {
    pub entries: Vec<ParsedEntry>,
    pub warnings: Vec<ParseWarning>,
}

/// Parse a whole ledger, keeping byte offsets for in-place marker edits
///
/// Works on raw bytes so a stray non-UTF-8 line costs a warning, not the file.
pub fn parse_ledger(content: &[u8]) -> ParsedLedger {
    let mut parsed = ParsedLedger::default();
    let mut offset = 0;

    for (index, raw_line) in content.split_inclusive(|b| *b == b'\n').enumerate() {
        let line_start = offset;
        offset += raw_line.len();

        let line = trim_line_ending(raw_line);
        let line = match std::str::from_utf8(line) {
            Ok(line) => line,
            Err(_) => {
                parsed.warnings.push(ParseWarning {
                    line: index + 1,
                    content: String::from_utf8_lossy(line).into_owned(),
                    reason: "invalid UTF-8".to_string(),
                });
                continue;
            }
        };
        if !CANDIDATE_RE.is_match(line) {
            continue;
        }

        match parse_entry_line(line) {
            Ok((marker_index, mut entry)) => {
                entry.line = index + 1;
                entry.marker_offset = line_start + marker_index;
                parsed.entries.push(entry);
            }
            Err(reason) => parsed.warnings.push(ParseWarning {
                line: index + 1,
                content: line.to_string(),
                reason: reason.to_string(),
            }),
        }
    }

    parsed
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Line ending used by the last terminated line; `\n` when there is none
pub fn line_ending(content: &[u8]) -> &'static str {
    match content.iter().rposition(|b| *b == b'\n') {
        Some(pos) if pos > 0 && content[pos - 1] == b'\r' => "\r\n",
        _ => "\n",
    }
}

/// Parse one checkbox line; returns the marker's byte index within the line
fn parse_entry_line(line: &str) -> Result<(usize, ParsedEntry), &'static str> {
    let caps = TASK_RE.captures(line).ok_or("malformed checkbox")?;
    let marker = caps.get(2).ok_or("malformed checkbox")?;

    let done = match marker.as_str() {
        " " => false,
        "x" | "X" => true,
        _ => return Err("unknown status marker"),
    };

    let rest = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    let link = LINK_RE.captures(rest).ok_or("missing capture link")?;

    let file_name = link.get(1).map(|m| m.as_str()).unwrap_or("");
    let destination = link
        .get(2)
        .or_else(|| link.get(3))
        .map(|m| m.as_str())
        .ok_or("missing capture link")?;
    let instruction = link.get(4).map(|m| m.as_str().trim()).unwrap_or("");

    if instruction.is_empty() {
        return Err("empty instruction");
    }

    Ok((
        marker.start(),
        ParsedEntry {
            line: 0,
            done,
            file_name: file_name.to_string(),
            image_path: PathBuf::from(destination),
            instruction: instruction.to_string(),
            marker_offset: 0,
        },
    ))
}

/// Format a new pending entry line (no trailing newline)
pub fn format_entry(image_path: &Path, instruction: &str) -> String {
    let file_name = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "- [ ] [{}](<{}>) {}",
        file_name,
        image_path.display(),
        instruction
    )
}

/// Collapse a multi-line submission onto one line
pub fn fold_instruction(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
