//! Configuration-home paths and storage layout constants.

use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};

/// Environment variable overriding the configuration home.
pub const KITOPS_HOME_ENV: &str = "KITOPS_HOME";

/// Environment variable overriding push concurrency.
pub const UPLOAD_CONCURRENCY_ENV: &str = "KITOPS_UPLOAD_CONCURRENCY";

/// Maximum depth of a parent-ModelKit reference chain.
pub const MAX_MODEL_REF_CHAIN: usize = 10;

/// Resolve the configuration home: `$KITOPS_HOME`, else `~/.kitops`.
pub fn config_home() -> PathBuf {
    if let Ok(home) = std::env::var(KITOPS_HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".kitops"))
        .unwrap_or_else(|| PathBuf::from(".kitops"))
}

/// Root of the content-addressed storage under the configuration home.
pub fn storage_path(config_home: &Path) -> PathBuf {
    config_home.join("storage")
}

/// Directory for in-flight downloads within a storage root.
pub fn ingest_path(storage_path: &Path) -> PathBuf {
    storage_path.join("ingest")
}

/// Filename of a per-repository index within the storage root.
///
/// Repository names contain path separators, so the name is hashed;
/// the repository string itself is recorded inside the index file.
pub fn local_index_filename(repo_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_name.as_bytes());
    format!("{:x}.index.json", hasher.finalize())
}

/// Whether a directory entry names a per-repository index file.
pub fn is_local_index_filename(name: &str) -> bool {
    name.ends_with(".index.json")
        && name
            .trim_end_matches(".index.json")
            .chars()
            .all(|c| c.is_ascii_hexdigit())
}
