use std::path::PathBuf;

use crate::state::SystemState;

/// Errors surfaced by the wiper engines.
///
/// Most per-file failures never reach callers as `Err`: missing scan roots
/// become failed `ScanResult`s, unreadable entries are logged and skipped,
/// and safety rejections are counted as skips. What remains here is what a
/// caller has to act on.
#[derive(Debug, thiserror::Error)]
pub enum WiperError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: SystemState, to: SystemState },

    #[error("Path does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Refusing to delete {}: {reason}", path.display())]
    UnsafeDeletion { path: PathBuf, reason: String },

    #[error("Invalid rule configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, WiperError>;
