//! Screenshot Store: a flat directory of immutable captured images
//!
//! - Names derive from capture time: `screenshot_YYYYMMDD_HHMMSS[_N].<ext>`
//! - Same-second collisions get a `_2`, `_3`, ... suffix, never an overwrite
//! - Writes go temp file + fsync + no-clobber hard link, so readers never see
//!   a partial image
//! - Owner-only permissions (0700 dir, 0600 files) on Unix

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persistence::{temp_path_for, TEMP_MARKER};

/// Maximum number of entries scanned by stale temp cleanup
const CLEANUP_SCAN_LIMIT: usize = 1000;

/// Age threshold for temp file cleanup (1 hour)
const CLEANUP_AGE_THRESHOLD: Duration = Duration::from_secs(3600);

/// Upper bound on disambiguation suffixes within one second
const MAX_SUFFIX: u32 = 1000;

const ID_PREFIX: &str = "screenshot_";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

static CAPTURE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^screenshot_(\d{8}_\d{6})(?:_(\d+))?$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("screenshot not found: {0}")]
    NotFound(String),
    #[error("refusing to store an empty image")]
    EmptyImage,
    #[error("no free screenshot name left for {0}")]
    NamesExhausted(String),
    #[error("screenshot store I/O error at {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Image encodings the store recognises by magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Tiff,
}

impl ImageFormat {
    /// Detect the format from leading bytes, defaulting to PNG
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            ImageFormat::Jpeg
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            ImageFormat::Tiff
        } else {
            ImageFormat::Png
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "tif" | "tiff" => Some(ImageFormat::Tiff),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Tiff => "tiff",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Tiff => "image/tiff",
        }
    }

    /// Whether MCP clients generally display this format inline
    pub fn renders_inline(self) -> bool {
        matches!(self, ImageFormat::Png | ImageFormat::Jpeg)
    }

    const ALL: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Tiff];
}

/// One saved screenshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// File stem, e.g. `screenshot_20261018_101500_2`
    pub id: String,
    /// Absolute location in the store
    pub image_path: PathBuf,
    pub file_name: String,
    /// Local wall-clock time encoded in the id
    pub captured_at: NaiveDateTime,
    /// Disambiguation sequence within the same second (1 = no suffix)
    pub sequence: u32,
    pub format: ImageFormat,
}

impl Capture {
    /// Parse a store file name back into a capture
    fn from_file_name(dir: &Path, file_name: &str) -> Option<Self> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        let format = ImageFormat::from_extension(ext)?;
        let (captured_at, sequence) = parse_capture_id(stem)?;

        Some(Self {
            id: stem.to_string(),
            image_path: dir.join(file_name),
            file_name: file_name.to_string(),
            captured_at,
            sequence,
            format,
        })
    }

    /// Creation-order key: capture second, then suffix number
    pub fn order_key(&self) -> (NaiveDateTime, u32) {
        (self.captured_at, self.sequence)
    }
}

/// Split a capture id into its timestamp and sequence number
pub fn parse_capture_id(id: &str) -> Option<(NaiveDateTime, u32)> {
    let caps = CAPTURE_ID_RE.captures(id)?;
    let stamp = caps.get(1)?.as_str();
    let captured_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let sequence = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 1,
    };
    Some((captured_at, sequence))
}

fn capture_id(captured_at: NaiveDateTime, sequence: u32) -> String {
    let stamp = captured_at.format(STAMP_FORMAT);
    if sequence <= 1 {
        format!("{}{}", ID_PREFIX, stamp)
    } else {
        format!("{}{}_{}", ID_PREFIX, stamp, sequence)
    }
}

/// Flat directory of captured images
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    dir: PathBuf,
}

impl ScreenshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| StoreError::io(&self.dir, e))?;
        }

        Ok(())
    }

    /// Persist a capture taken now
    pub fn save(&self, image: &[u8]) -> Result<Capture, StoreError> {
        self.save_at(image, Local::now().naive_local())
    }

    /// Persist a capture taken at `captured_at`
    pub fn save_at(&self, image: &[u8], captured_at: NaiveDateTime) -> Result<Capture, StoreError> {
        if image.is_empty() {
            return Err(StoreError::EmptyImage);
        }
        self.ensure_dir()?;

        let format = ImageFormat::sniff(image);
        let base_id = capture_id(captured_at, 1);
        let temp_path = temp_path_for(&self.dir.join(format!("{}.{}", base_id, format.extension())))
            .map_err(|e| StoreError::io(&self.dir, io::Error::new(io::ErrorKind::Other, format!("{:#}", e))))?;

        if let Err(e) = write_synced(&temp_path, image) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(&temp_path, e));
        }

        let result = self.link_unique(&temp_path, captured_at, format);
        let _ = fs::remove_file(&temp_path);

        if let Ok(capture) = &result {
            if !format.renders_inline() {
                warn!(
                    path = %capture.image_path.display(),
                    mime = format.mime_type(),
                    "stored image in a format most agents cannot display; copy screenshots as PNG"
                );
            }
        }
        result
    }

    /// Claim the first free name for this second without ever clobbering
    fn link_unique(
        &self,
        temp_path: &Path,
        captured_at: NaiveDateTime,
        format: ImageFormat,
    ) -> Result<Capture, StoreError> {
        for sequence in 1..=MAX_SUFFIX {
            let id = capture_id(captured_at, sequence);
            if self.id_taken(&id) {
                continue;
            }

            let file_name = format!("{}.{}", id, format.extension());
            let final_path = self.dir.join(&file_name);
            match fs::hard_link(temp_path, &final_path) {
                Ok(()) => {
                    debug!(path = %final_path.display(), "saved screenshot");
                    return Ok(Capture {
                        id,
                        image_path: final_path,
                        file_name,
                        captured_at,
                        sequence,
                        format,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::io(&final_path, e)),
            }
        }

        Err(StoreError::NamesExhausted(capture_id(captured_at, 1)))
    }

    /// An id is taken if a file with that stem exists under any image extension
    fn id_taken(&self, id: &str) -> bool {
        ImageFormat::ALL
            .iter()
            .any(|f| self.dir.join(format!("{}.{}", id, f.extension())).exists())
    }

    /// All captures in creation order
    pub fn list(&self) -> Result<Vec<Capture>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut captures = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') || name.contains(TEMP_MARKER) {
                continue;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(capture) = Capture::from_file_name(&self.dir, name) {
                captures.push(capture);
            }
        }

        captures.sort_by_key(Capture::order_key);
        Ok(captures)
    }

    /// Most recent capture, if any
    pub fn latest(&self) -> Result<Option<Capture>, StoreError> {
        Ok(self.list()?.pop())
    }

    /// Find a capture by id, file name or path inside the store
    pub fn resolve(&self, reference: &str) -> Result<Capture, StoreError> {
        let not_found = || StoreError::NotFound(reference.to_string());
        let reference_path = Path::new(reference.trim());

        let has_dir = reference_path
            .parent()
            .map(|p| !p.as_os_str().is_empty())
            .unwrap_or(false);
        if has_dir && !self.contains_path(reference_path) {
            return Err(not_found());
        }

        let key = reference_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(not_found)?;

        self.list()?
            .into_iter()
            .find(|c| c.file_name == key || c.id == key)
            .ok_or_else(not_found)
    }

    /// Whether `path` lives directly inside the store directory
    fn contains_path(&self, path: &Path) -> bool {
        let Some(parent) = path.parent() else {
            return false;
        };
        match (parent.canonicalize(), self.dir.canonicalize()) {
            (Ok(parent), Ok(dir)) => parent == dir,
            _ => false,
        }
    }

    /// Read the bytes of a stored capture
    pub fn read(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        let capture = self.resolve(reference)?;
        fs::read(&capture.image_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(reference.to_string()),
            _ => StoreError::io(&capture.image_path, e),
        })
    }

    /// Remove temp files older than an hour left behind by interrupted writes
    ///
    /// Returns (deleted_count, scanned_count, hit_limit)
    pub fn cleanup_stale_temps(&self) -> io::Result<(usize, usize, bool)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0, false)),
            Err(e) => return Err(e),
        };

        let now = SystemTime::now();
        let mut scanned = 0;
        let mut deleted = 0;

        for entry in entries.filter_map(|e| e.ok()) {
            if scanned >= CLEANUP_SCAN_LIMIT {
                warn!(
                    limit = CLEANUP_SCAN_LIMIT,
                    dir = %self.dir.display(),
                    "hit temp cleanup scan limit"
                );
                return Ok((deleted, scanned, true));
            }
            scanned += 1;

            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains(TEMP_MARKER))
                .unwrap_or(false);
            if !is_temp || !path.is_file() {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if matches!(age, Some(age) if age > CLEANUP_AGE_THRESHOLD) {
                match fs::remove_file(&path) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(path = %path.display(), "failed to delete stale temp file: {}", e),
                }
            }
        }

        Ok((deleted, scanned, false))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    pub(crate) const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-png-body";

    pub(crate) fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_save_names_by_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path().join("shots"));

        let capture = store.save_at(PNG_BYTES, at(10, 15, 0)).unwrap();

        assert_eq!(capture.id, "screenshot_20261018_101500");
        assert_eq!(capture.file_name, "screenshot_20261018_101500.png");
        assert_eq!(capture.format, ImageFormat::Png);
        assert_eq!(fs::read(&capture.image_path).unwrap(), PNG_BYTES);
    }

    #[test]
    fn test_same_second_collision_gets_suffix() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());

        let first = store.save_at(b"\x89PNGfirst", at(9, 0, 0)).unwrap();
        let second = store.save_at(b"\x89PNGsecond", at(9, 0, 0)).unwrap();
        let jpeg = store.save_at(b"\xFF\xD8\xFFthird", at(9, 0, 0)).unwrap();

        assert_eq!(first.id, "screenshot_20261018_090000");
        assert_eq!(second.id, "screenshot_20261018_090000_2");
        assert_eq!(jpeg.id, "screenshot_20261018_090000_3");
        assert_eq!(jpeg.file_name, "screenshot_20261018_090000_3.jpg");

        // The first image was not overwritten
        assert_eq!(fs::read(&first.image_path).unwrap(), b"\x89PNGfirst");
    }

    #[test]
    fn test_list_orders_by_creation_not_lexically() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());

        for _ in 0..11 {
            store.save_at(PNG_BYTES, at(8, 0, 0)).unwrap();
        }
        store.save_at(PNG_BYTES, at(7, 59, 59)).unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 12);
        assert_eq!(ids[0], "screenshot_20261018_075959");
        assert_eq!(ids[1], "screenshot_20261018_080000");
        assert_eq!(ids[2], "screenshot_20261018_080000_2");
        assert_eq!(ids[10], "screenshot_20261018_080000_10");
        assert_eq!(ids[11], "screenshot_20261018_080000_11");
    }

    #[test]
    fn test_list_skips_temps_and_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());
        store.save_at(PNG_BYTES, at(1, 2, 3)).unwrap();

        fs::write(temp_dir.path().join("notes.txt"), "hi").unwrap();
        fs::write(temp_dir.path().join("holiday.png"), PNG_BYTES).unwrap();
        fs::write(
            temp_dir
                .path()
                .join(".screenshot_20261018_010204.png.tmp.1.0"),
            PNG_BYTES,
        )
        .unwrap();

        let captures = store.list().unwrap();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].id, "screenshot_20261018_010203");
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());
        store.save_at(PNG_BYTES, at(1, 1, 1)).unwrap();

        let temp_files: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(TEMP_MARKER))
            .collect();
        assert!(temp_files.is_empty());
    }

    #[test]
    fn test_empty_image_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path().join("shots"));

        assert!(matches!(store.save(&[]), Err(StoreError::EmptyImage)));
        assert!(!store.dir().exists());
    }

    #[test]
    fn test_read_by_path_name_and_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());
        let capture = store.save_at(PNG_BYTES, at(12, 0, 0)).unwrap();

        let by_path = store
            .read(capture.image_path.to_str().unwrap())
            .unwrap();
        let by_name = store.read(&capture.file_name).unwrap();
        let by_id = store.read(&capture.id).unwrap();

        assert_eq!(by_path, PNG_BYTES);
        assert_eq!(by_name, PNG_BYTES);
        assert_eq!(by_id, PNG_BYTES);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());

        let err = store.read("screenshot_20990101_000000.png").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_read_outside_store_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path().join("shots"));
        let capture = store.save_at(PNG_BYTES, at(12, 0, 0)).unwrap();

        // Same file name, different directory
        let elsewhere = temp_dir.path().join(&capture.file_name);
        fs::write(&elsewhere, PNG_BYTES).unwrap();

        let err = store.read(elsewhere.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());
        assert!(store.latest().unwrap().is_none());

        store.save_at(PNG_BYTES, at(10, 0, 0)).unwrap();
        let newest = store.save_at(PNG_BYTES, at(11, 0, 0)).unwrap();
        store.save_at(PNG_BYTES, at(9, 0, 0)).unwrap();

        assert_eq!(store.latest().unwrap().unwrap(), newest);
    }

    #[test]
    fn test_format_sniffing() {
        assert_eq!(ImageFormat::sniff(b"\x89PNG\r\n"), ImageFormat::Png);
        assert_eq!(ImageFormat::sniff(b"\xFF\xD8\xFF\xE0"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::sniff(b"II*\0rest"), ImageFormat::Tiff);
        assert_eq!(ImageFormat::sniff(b"MM\0*rest"), ImageFormat::Tiff);
        assert_eq!(ImageFormat::sniff(b"????"), ImageFormat::Png);
    }

    #[test]
    fn test_tiff_clipboard_image_is_kept_and_flagged() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path().join("shots"));

        let tiff = b"MM\0*clipboard-tiff";
        let capture = store.save_at(tiff, at(10, 15, 0)).unwrap();

        assert_eq!(capture.format, ImageFormat::Tiff);
        assert_eq!(capture.file_name, "screenshot_20261018_101500.tiff");
        assert_eq!(fs::read(&capture.image_path).unwrap(), tiff);
        assert_eq!(capture.format.mime_type(), "image/tiff");
        assert!(!capture.format.renders_inline());
        assert!(ImageFormat::Png.renders_inline());
        assert!(ImageFormat::Jpeg.renders_inline());

        // A PNG in the same second still gets a fresh name
        let png = store.save_at(PNG_BYTES, at(10, 15, 0)).unwrap();
        assert_eq!(png.file_name, "screenshot_20261018_101500_2.png");
    }

    #[test]
    fn test_parse_capture_id() {
        assert_eq!(
            parse_capture_id("screenshot_20261018_101500"),
            Some((at(10, 15, 0), 1))
        );
        assert_eq!(
            parse_capture_id("screenshot_20261018_101500_7"),
            Some((at(10, 15, 0), 7))
        );
        assert_eq!(parse_capture_id("screenshot_2026_1015"), None);
        assert_eq!(parse_capture_id("clipboard_20261018_101500"), None);
    }

    #[test]
    fn test_cleanup_stale_temps() {
        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path());
        let kept = store.save_at(PNG_BYTES, at(1, 0, 0)).unwrap();

        let stale = temp_dir.path().join(".screenshot_x.png.tmp.42.0");
        let fresh = temp_dir.path().join(".screenshot_y.png.tmp.42.1");
        fs::write(&stale, b"partial").unwrap();
        fs::write(&fresh, b"partial").unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
        filetime::set_file_mtime(&stale, filetime::FileTime::from_system_time(two_hours_ago))
            .unwrap();

        let (deleted, scanned, hit_limit) = store.cleanup_stale_temps().unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(scanned, 3);
        assert!(!hit_limit);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(kept.image_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = ScreenshotStore::new(temp_dir.path().join("shots"));
        let capture = store.save_at(PNG_BYTES, at(1, 0, 0)).unwrap();

        let mode = fs::metadata(&capture.image_path)
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
