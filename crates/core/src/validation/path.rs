//! Path and filename checks.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::ValidationError;

/// Longest accepted path in characters (legacy Windows `MAX_PATH`).
pub const MAX_PATH_LENGTH: usize = 260;

/// Extensions the engine and the host exchange.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "mkv", "avi", "webm", "m4v", "mxf", "gif", "png", "jpg", "jpeg", "tif",
    "tiff", "exr", "wav", "mp3", "aac", "json", "txt", "log",
];

/// Characters that no mainstream filesystem accepts in a file name.
const RESERVED_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

static RESERVED_DEVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(con|prn|aux|nul|com[0-9]|lpt[0-9])$").expect("valid regex")
});

/// Base directories a validated path must live under.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    roots: Vec<PathBuf>,
}

static DEFAULT_POLICY: LazyLock<PathPolicy> = LazyLock::new(PathPolicy::platform_default);

impl PathPolicy {
    /// A policy that only accepts paths under `roots`.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Home directory, temp directory and the platform app-data roots.
    pub fn platform_default() -> Self {
        let mut roots = vec![std::env::temp_dir()];
        roots.extend(
            [
                dirs::home_dir(),
                dirs::data_dir(),
                dirs::data_local_dir(),
                dirs::config_dir(),
                dirs::cache_dir(),
            ]
            .into_iter()
            .flatten(),
        );
        roots.sort();
        roots.dedup();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Validate and normalize `raw` against this policy.
    pub fn validate(&self, raw: &str) -> Result<PathBuf, ValidationError> {
        if raw.trim().is_empty() {
            return Err(ValidationError::Empty("path"));
        }

        let stripped: String = raw.chars().filter(|c| *c != '\0').collect();
        let normalized = normalize_separators(&stripped);

        if normalized
            .split(['/', '\\'])
            .any(|segment| segment == "..")
        {
            return Err(ValidationError::PathTraversal(normalized));
        }

        let len = normalized.chars().count();
        if len > MAX_PATH_LENGTH {
            return Err(ValidationError::PathTooLong {
                len,
                max: MAX_PATH_LENGTH,
            });
        }

        let path = Path::new(&normalized);
        if !path.is_absolute() {
            return Err(ValidationError::PathNotAbsolute(normalized));
        }

        // `components()` drops `.` segments and repeated separators.
        let cleaned: PathBuf = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();

        if !self.roots.iter().any(|root| cleaned.starts_with(root)) {
            return Err(ValidationError::PathNotAllowed(
                cleaned.to_string_lossy().into_owned(),
            ));
        }

        Ok(cleaned)
    }
}

/// Validate `raw` against the platform default [`PathPolicy`].
pub fn validate_path(raw: &str) -> Result<PathBuf, ValidationError> {
    DEFAULT_POLICY.validate(raw)
}

fn normalize_separators(raw: &str) -> String {
    if cfg!(windows) {
        raw.replace('/', "\\")
    } else {
        raw.replace('\\', "/")
    }
}

/// Sanitize a bare file name.
///
/// Strips filesystem-reserved and control characters, rejects OS device
/// names and, when an extension is present, requires it to be one of
/// [`ALLOWED_EXTENSIONS`]. Returns the cleaned name.
pub fn validate_filename(name: &str) -> Result<String, ValidationError> {
    let cleaned: String = name
        .chars()
        .filter(|c| !RESERVED_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();

    if cleaned.is_empty() {
        return Err(ValidationError::Empty("filename"));
    }

    let (stem, extension) = match cleaned.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (cleaned.as_str(), None),
    };

    let device = stem.split('.').next().unwrap_or(stem).trim();
    if RESERVED_DEVICE_RE.is_match(device) {
        return Err(ValidationError::ReservedFilename(cleaned.clone()));
    }

    if let Some(ext) = extension {
        let lower = ext.to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&lower.as_str()) {
            return Err(ValidationError::ExtensionNotAllowed(ext.to_string()));
        }
    }

    Ok(cleaned)
}

/// Reject files larger than `max_bytes`.
///
/// The one validator that touches the filesystem; callers use it before
/// reading payloads whose size they do not control.
pub fn validate_file_size(path: &Path, max_bytes: u64) -> Result<u64, ValidationError> {
    let metadata = std::fs::metadata(path).map_err(|e| ValidationError::FileUnreadable {
        path: path.to_string_lossy().into_owned(),
        reason: e.to_string(),
    })?;
    let size = metadata.len();
    if size > max_bytes {
        return Err(ValidationError::FileTooLarge {
            size,
            max: max_bytes,
        });
    }
    Ok(size)
}
