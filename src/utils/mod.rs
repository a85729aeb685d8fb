mod hash;

pub use hash::compute_hash;

use std::path::{Path, PathBuf};

/// The name of the folder holding engine state
pub const STATE_FOLDER: &str = ".stepwise";

/// Default file name of the engine configuration
pub const CONFIG_FILE: &str = "stepwise.json";

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Turn a migration name into something safe to use as a file name
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Get current timestamp in ISO 8601 format
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
