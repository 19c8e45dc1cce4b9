//! Tar extraction with path-traversal safety and overwrite policy.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use kitops_core::progress::Progress;
use kitops_core::{ContentDigest, KitError, Result};

/// Resolve `relative` against `root` and require the result to stay
/// inside `root`. Rejects absolute paths, `..` escapes, and symlinked
/// ancestors that point outside the root.
pub fn verify_subpath(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(KitError::PathTraversal {
            path: rel.to_path_buf(),
        });
    }
    let mut depth: i64 = 0;
    for component in rel.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(KitError::PathTraversal {
                        path: rel.to_path_buf(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(KitError::PathTraversal {
                    path: rel.to_path_buf(),
                })
            }
        }
    }

    let joined = root.join(rel);

    // Symlink-safe check: canonicalize the deepest existing ancestor and
    // require it to remain under the canonical root.
    let canonical_root = root.canonicalize()?;
    let mut existing: &Path = &joined;
    while !existing.exists() {
        existing = existing.parent().ok_or_else(|| KitError::PathTraversal {
            path: joined.clone(),
        })?;
    }
    let canonical = existing.canonicalize()?;
    if !canonical.starts_with(&canonical_root) {
        return Err(KitError::PathTraversal { path: joined });
    }
    Ok(joined)
}

/// Extract a tar stream into `extract_dir`.
///
/// Directories are created with their header mode; regular files honor
/// the overwrite / ignore-existing policy; any other entry type fails.
pub fn extract_tar<R: Read>(
    reader: R,
    extract_dir: &Path,
    overwrite: bool,
    ignore_existing: bool,
    progress: &dyn Progress,
    digest: &ContentDigest,
) -> Result<()> {
    let mut archive = tar::Archive::new(ProgressReader {
        inner: reader,
        progress,
        digest,
    });
    archive.set_preserve_permissions(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let out_path = verify_subpath(extract_dir, &name)?;
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                if out_path.exists() {
                    if !out_path.is_dir() {
                        return Err(KitError::Conflict { path: out_path });
                    }
                } else {
                    progress.debug(&format!("creating directory {}", out_path.display()));
                    create_dir_with_mode(&out_path, mode)?;
                }
            }
            tar::EntryType::Regular => {
                if let Ok(metadata) = std::fs::symlink_metadata(&out_path) {
                    if ignore_existing {
                        progress.debug(&format!(
                            "file {} already exists; skipping",
                            out_path.display()
                        ));
                        continue;
                    }
                    if !overwrite || !metadata.is_file() {
                        return Err(KitError::Conflict { path: out_path });
                    }
                }
                progress.debug(&format!("unpacking file {}", out_path.display()));
                let size = entry.header().size()?;
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = open_with_mode(&out_path, mode)?;
                let written = std::io::copy(&mut entry, &mut file)?;
                if written != size {
                    return Err(KitError::Truncated { path: out_path });
                }
            }
            _ => {
                return Err(KitError::UnsupportedEntry { name });
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode | 0o700)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_with_mode(path: &Path, _mode: u32) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(mode)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> Result<std::fs::File> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?)
}

/// Reports bytes read from a layer stream to the progress sink.
struct ProgressReader<'a, R> {
    inner: R,
    progress: &'a dyn Progress,
    digest: &'a ContentDigest,
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.progress.blob_bytes(self.digest, n as u64);
        }
        Ok(n)
    }
}
