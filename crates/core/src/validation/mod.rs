//! Input validation for everything that crosses a trust boundary.
//!
//! Every function here is a deterministic function of its input: it either
//! returns a normalized value or a specific [`ValidationError`]. The only
//! I/O is [`path::validate_file_size`], which is kept separate on purpose.

pub mod args;
pub mod json;
pub mod net;
pub mod path;

pub use args::validate_command_args;
pub use json::{parse_json_safely, DEFAULT_MAX_JSON_DEPTH};
pub use net::{is_loopback_host, validate_port, validate_url};
pub use path::{validate_file_size, validate_filename, validate_path, PathPolicy};

/// Why an input was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Empty input: {0}")]
    Empty(&'static str),

    #[error("Path contains a parent-directory segment: {0}")]
    PathTraversal(String),

    #[error("Path is {len} characters long (maximum {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("Path is not absolute: {0}")]
    PathNotAbsolute(String),

    #[error("Path is outside the allowed directories: {0}")]
    PathNotAllowed(String),

    #[error("Reserved device name: {0}")]
    ReservedFilename(String),

    #[error("File extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error("Unsafe character in argument {index}: {arg:?}")]
    UnsafeArgument { index: usize, arg: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL scheme not allowed: {0}")]
    SchemeNotAllowed(String),

    #[error("Private network host not allowed: {0}")]
    PrivateNetworkHost(String),

    #[error("Port {0} outside the allowed range 1024-65535")]
    PortOutOfRange(i64),

    #[error("JSON nesting depth exceeds {max}")]
    JsonTooDeep { max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("File is {size} bytes (maximum {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Cannot inspect file {path}: {reason}")]
    FileUnreadable { path: String, reason: String },
}
