// Locating the screenfix-daemon binary from the tool server

use std::path::{Path, PathBuf};

use crate::config::DAEMON_BIN_ENV;

pub const DAEMON_BINARY: &str = if cfg!(windows) {
    "screenfix-daemon.exe"
} else {
    "screenfix-daemon"
};

/// Common install locations checked last
pub fn fallback_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();

    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".local").join("bin"));
        locations.push(home.join(".cargo").join("bin"));
    }

    #[cfg(target_os = "macos")]
    locations.push(PathBuf::from("/opt/homebrew/bin"));

    #[cfg(unix)]
    locations.push(PathBuf::from("/usr/local/bin"));

    locations
}

fn candidate_in(dir: &Path) -> Option<PathBuf> {
    let candidate = dir.join(DAEMON_BINARY);
    candidate.is_file().then_some(candidate)
}

/// Resolve the daemon binary for the current process
///
/// Resolution order:
/// 1) `SCREENFIX_DAEMON_BIN`
/// 2) Next to `current_exe()` (installed pair / cargo target dir)
/// 3) One level up from `current_exe()` (cargo's `deps/` for test binaries)
/// 4) Fallback install locations
pub fn resolve_daemon_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(DAEMON_BIN_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
        tracing::warn!(
            path = %path.display(),
            "{} does not point at a file, falling back to discovery",
            DAEMON_BIN_ENV
        );
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(current) = dir else {
                break;
            };
            if let Some(found) = candidate_in(current) {
                return Some(found);
            }
            dir = current.parent();
        }
    }

    fallback_locations()
        .iter()
        .find_map(|dir| candidate_in(dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fallback_locations_not_empty() {
        if dirs::home_dir().is_some() || cfg!(unix) {
            assert!(!fallback_locations().is_empty());
        }
    }

    #[test]
    fn test_candidate_in_requires_file() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(candidate_in(temp_dir.path()), None);

        std::fs::create_dir(temp_dir.path().join(DAEMON_BINARY)).unwrap();
        assert_eq!(candidate_in(temp_dir.path()), None);
    }

    #[test]
    fn test_candidate_in_finds_binary() {
        let temp_dir = TempDir::new().unwrap();
        let bin = temp_dir.path().join(DAEMON_BINARY);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();

        assert_eq!(candidate_in(temp_dir.path()), Some(bin));
    }
}
