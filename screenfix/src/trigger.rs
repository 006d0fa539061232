// Capture triggers
// A hotkey binding sends SIGUSR1 to the daemon; the clipboard watcher turns
// a newly copied image into a trigger that already carries its bytes.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::capture::{CaptureError, ClipboardSource};
use crate::logging::Chain;

/// Why a pipeline cycle started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Ask the capture capability for a region
    Hotkey,
    /// Use an image that just appeared on the clipboard
    Clipboard(Vec<u8>),
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Hotkey => "hotkey",
            Trigger::Clipboard(_) => "clipboard",
        }
    }
}

/// SHA-256 hex digest of image bytes
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Detects clipboard image changes by fingerprint
pub struct ClipboardWatcher {
    source: Box<dyn ClipboardSource>,
    last_seen: Option<String>,
    primed: bool,
}

impl ClipboardWatcher {
    pub fn new(source: Box<dyn ClipboardSource>) -> Self {
        Self {
            source,
            last_seen: None,
            primed: false,
        }
    }

    /// Poll once. The first poll only records what is already there.
    pub fn poll(&mut self) -> Option<Trigger> {
        let image = match self.source.read_image() {
            Ok(image) => image,
            Err(CaptureError::TimedOut { .. }) => {
                debug!("clipboard read timed out");
                return None;
            }
            Err(e) => {
                warn!("clipboard read failed: {}", Chain(&e));
                return None;
            }
        };

        let first_poll = !self.primed;
        self.primed = true;

        let image = image?;
        let digest = fingerprint(&image);
        if self.last_seen.as_deref() == Some(digest.as_str()) {
            return None;
        }
        self.last_seen = Some(digest);

        if first_poll {
            debug!("recorded clipboard image present at startup");
            return None;
        }
        Some(Trigger::Clipboard(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedClipboard(VecDeque<Option<Vec<u8>>>);

    impl ClipboardSource for ScriptedClipboard {
        fn read_image(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
            Ok(self.0.pop_front().unwrap_or(None))
        }
    }

    fn watcher(script: Vec<Option<&[u8]>>) -> ClipboardWatcher {
        ClipboardWatcher::new(Box::new(ScriptedClipboard(
            script.into_iter().map(|s| s.map(|b| b.to_vec())).collect(),
        )))
    }

    #[test]
    fn test_startup_image_does_not_trigger() {
        let mut w = watcher(vec![Some(b"old"), Some(b"old"), Some(b"new"), Some(b"new")]);

        assert_eq!(w.poll(), None);
        assert_eq!(w.poll(), None);
        assert_eq!(w.poll(), Some(Trigger::Clipboard(b"new".to_vec())));
        assert_eq!(w.poll(), None);
    }

    #[test]
    fn test_empty_clipboard_at_startup_then_image() {
        let mut w = watcher(vec![None, Some(b"img")]);

        assert_eq!(w.poll(), None);
        assert_eq!(w.poll(), Some(Trigger::Clipboard(b"img".to_vec())));
    }

    #[test]
    fn test_recopying_previous_image_after_another_triggers() {
        let mut w = watcher(vec![None, Some(b"a"), Some(b"b"), Some(b"a")]);

        assert_eq!(w.poll(), None);
        assert!(w.poll().is_some());
        assert!(w.poll().is_some());
        assert_eq!(w.poll(), Some(Trigger::Clipboard(b"a".to_vec())));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
