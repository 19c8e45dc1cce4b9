//! Local content-addressed ModelKit store.
//!
//! One `LocalRepo` is a view of the shared blob store scoped to a single
//! `registry/repository`. Blobs live under `blobs/<alg>/<hex>` and are
//! shared across repositories; manifest visibility and tags are tracked
//! in the per-repository index.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use kitops_core::config::ingest_path;
use kitops_core::{Descriptor, Kitfile, KitError, Manifest, Result};

use super::index::{all_repo_indexes, referenced_elsewhere, ManifestIndex};
use crate::remote::ByteReader;

/// Path of a blob within a storage root.
pub fn blob_path(storage_path: &Path, desc: &Descriptor) -> PathBuf {
    storage_path
        .join("blobs")
        .join(desc.digest.algorithm())
        .join(desc.digest.encoded())
}

/// A single repository's view of the local store.
pub struct LocalRepo {
    storage_path: PathBuf,
    repo_name: String,
    local_index: Mutex<ManifestIndex>,
    shared_index: Mutex<ManifestIndex>,
}

impl LocalRepo {
    /// Open (or create) the repository `repo_name` under `storage_path`.
    pub fn open(storage_path: &Path, repo_name: &str) -> Result<Self> {
        std::fs::create_dir_all(storage_path)?;
        let local_index = ManifestIndex::for_repo(storage_path, repo_name)?;
        let shared_index = ManifestIndex::shared(storage_path)?;
        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            repo_name: repo_name.to_string(),
            local_index: Mutex::new(local_index),
            shared_index: Mutex::new(shared_index),
        })
    }

    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn blob_path(&self, desc: &Descriptor) -> PathBuf {
        blob_path(&self.storage_path, desc)
    }

    /// Create the blob and ingest directories for a descriptor's algorithm.
    pub fn ensure_dirs(&self, desc: &Descriptor) -> Result<()> {
        std::fs::create_dir_all(self.storage_path.join("blobs").join(desc.digest.algorithm()))?;
        std::fs::create_dir_all(ingest_path(&self.storage_path))?;
        Ok(())
    }

    /// Whether a descriptor's content is present in this repository.
    ///
    /// Manifests consult the per-repository index, so pruning one
    /// repository does not make a shared blob appear present in another.
    pub async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        if desc.is_manifest() {
            return Ok(self.local_index.lock().await.exists(desc));
        }
        Ok(self.blob_path(desc).is_file())
    }

    /// Open a blob for reading.
    pub async fn fetch(&self, desc: &Descriptor) -> Result<tokio::fs::File> {
        if desc.is_manifest() && !self.local_index.lock().await.exists(desc) {
            return Err(KitError::NotFound(desc.digest.to_string()));
        }
        let path = self.blob_path(desc);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KitError::NotFound(desc.digest.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a blob fully into memory.
    pub async fn fetch_bytes(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let mut file = self.fetch(desc).await?;
        let mut data = Vec::with_capacity(desc.size as usize);
        file.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Store content for a descriptor, verifying its digest.
    ///
    /// Manifests tolerate the blob already existing in the shared store
    /// (the bytes are skipped and only the index entry is added); other
    /// blobs fail with `Conflict` if already present.
    pub async fn push(&self, desc: &Descriptor, mut content: ByteReader) -> Result<()> {
        let path = self.blob_path(desc);
        if path.is_file() {
            if !desc.is_manifest() {
                return Err(KitError::Conflict { path });
            }
            self.register_manifest(desc).await?;
            return Ok(());
        }

        self.ensure_dirs(desc)?;
        let ingest_dir = ingest_path(&self.storage_path);
        let ingest = tempfile::Builder::new()
            .prefix(&format!("{}_", desc.digest.encoded()))
            .tempfile_in(&ingest_dir)?;

        let mut verifier = desc.digest.verifier()?;
        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = content.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            verifier.update(&buf[..n]);
            ingest.as_file().write_all(&buf[..n])?;
            written += n as u64;
        }
        if written != desc.size {
            return Err(KitError::SizeMismatch {
                digest: desc.digest.to_string(),
                expected: desc.size,
                actual: written,
            });
        }
        verifier.verify()?;

        let file = ingest
            .persist(&path)
            .map_err(|e| KitError::Io(e.error))?;
        set_blob_permissions(&file)?;
        drop(file);

        if desc.is_manifest() {
            self.register_manifest(desc).await?;
        }
        Ok(())
    }

    /// Resolve a tag or digest string within this repository.
    pub async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.local_index.lock().await.resolve(reference)
    }

    /// Record a manifest in the per-repository index and the shared index.
    pub async fn register_manifest(&self, desc: &Descriptor) -> Result<()> {
        {
            let mut index = self.local_index.lock().await;
            index.add_manifest(desc);
            index.save()?;
        }
        let mut shared = self.shared_index.lock().await;
        shared.add_manifest(desc);
        shared.save()
    }

    pub async fn tag(&self, desc: &Descriptor, tag: &str) -> Result<()> {
        let mut index = self.local_index.lock().await;
        index.tag(desc, tag)?;
        index.save()
    }

    pub async fn untag(&self, tag: &str) -> Result<()> {
        let mut index = self.local_index.lock().await;
        index.untag(tag)?;
        index.save()
    }

    /// Delete a descriptor's content from this repository.
    ///
    /// Manifests are removed from the per-repository index always; the
    /// blob and the shared-index entry are removed only when no other
    /// repository still references the manifest. Non-manifest blobs are
    /// deleted from the shared store directly.
    pub async fn delete(&self, desc: &Descriptor) -> Result<()> {
        if !desc.is_manifest() {
            return remove_file_if_exists(&self.blob_path(desc));
        }

        {
            let mut index = self.local_index.lock().await;
            if !index.delete(desc) {
                return Err(KitError::NotFound(desc.digest.to_string()));
            }
            index.save()?;
        }
        if !referenced_elsewhere(&self.storage_path, desc, &self.repo_name)? {
            remove_file_if_exists(&self.blob_path(desc))?;
            let mut shared = self.shared_index.lock().await;
            shared.delete(desc);
            shared.save()?;
        }
        Ok(())
    }

    /// All manifests known to this repository.
    pub async fn list_manifests(&self) -> Vec<Descriptor> {
        self.local_index.lock().await.manifests().to_vec()
    }

    pub async fn list_tags(&self, desc: &Descriptor) -> Vec<String> {
        self.local_index.lock().await.list_tags(desc)
    }

    /// Fetch and parse a manifest blob.
    pub async fn get_manifest(&self, desc: &Descriptor) -> Result<Manifest> {
        let data = self.fetch_bytes(desc).await?;
        Manifest::from_bytes(&data)
    }

    /// Fetch and parse the Kitfile config of a manifest.
    pub async fn get_kitfile(&self, manifest: &Manifest) -> Result<Kitfile> {
        let data = self.fetch_bytes(&manifest.config).await?;
        Kitfile::from_bytes(&data)
    }

    /// Remove leftover files from the ingest directory.
    pub fn cleanup_ingest_dir(&self) -> Result<()> {
        let ingest = ingest_path(&self.storage_path);
        let entries = match std::fs::read_dir(&ingest) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                remove_file_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }
}

/// Enumerate every repository under a storage root as `repo:tag` strings.
pub fn all_repos_with_tags(storage_path: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for index in all_repo_indexes(storage_path)? {
        let Some(repo) = index.repository() else {
            continue;
        };
        for manifest in index.manifests() {
            for tag in index.list_tags(manifest) {
                out.push(format!("{repo}:{tag}"));
            }
        }
    }
    Ok(out)
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
pub(crate) fn set_blob_permissions(file: &std::fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_blob_permissions(_file: &std::fs::File) -> Result<()> {
    Ok(())
}
