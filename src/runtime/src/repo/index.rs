//! Shared and per-repository manifest indexes.
//!
//! The blob store is flat and shared across repositories; visibility is
//! tracked by two JSON indexes. `index.json` lists every manifest present
//! anywhere; `<sha256(repo)>.index.json` lists the manifests and tags of
//! one `registry/repository`. A blob may therefore exist on disk without
//! being visible in a given repository.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kitops_core::config::{is_local_index_filename, local_index_filename};
use kitops_core::{ContentDigest, Descriptor, KitError, Result};

/// Annotation key carrying a manifest's tag list (comma separated).
pub const TAGS_ANNOTATION: &str = "ml.kitops.modelkit.tags";

const INDEX_SCHEMA_VERSION: u32 = 2;

/// On-disk shape shared by both index kinds.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repository: Option<String>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// A manifest index backed by a JSON file.
///
/// Callers serialize read-modify-write cycles behind a single-writer lock;
/// this type itself performs no locking.
#[derive(Debug)]
pub struct ManifestIndex {
    path: PathBuf,
    repository: Option<String>,
    manifests: Vec<Descriptor>,
}

impl ManifestIndex {
    /// Load the shared index of a storage root, creating it empty if absent.
    pub fn shared(storage_path: &Path) -> Result<Self> {
        Self::load(storage_path.join("index.json"), None)
    }

    /// Load the per-repository index for `repo_name`.
    pub fn for_repo(storage_path: &Path, repo_name: &str) -> Result<Self> {
        Self::load(
            storage_path.join(local_index_filename(repo_name)),
            Some(repo_name.to_string()),
        )
    }

    fn load(path: PathBuf, repository: Option<String>) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                repository,
                manifests: Vec::new(),
            });
        }
        let data = std::fs::read(&path)?;
        let file: IndexFile = serde_json::from_slice(&data)?;
        Ok(Self {
            path,
            repository: repository.or(file.repository),
            manifests: file.manifests,
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IndexFile {
            schema_version: INDEX_SCHEMA_VERSION,
            repository: self.repository.clone(),
            manifests: self.manifests.clone(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn manifests(&self) -> &[Descriptor] {
        &self.manifests
    }

    pub fn exists(&self, desc: &Descriptor) -> bool {
        self.manifests.iter().any(|m| m.digest == desc.digest)
    }

    /// Resolve a tag or digest string to a manifest descriptor.
    pub fn resolve(&self, reference: &str) -> Result<Descriptor> {
        if let Ok(digest) = ContentDigest::parse(reference) {
            return self
                .manifests
                .iter()
                .find(|m| m.digest == digest)
                .cloned()
                .ok_or_else(|| KitError::NotFound(reference.to_string()));
        }
        self.manifests
            .iter()
            .find(|m| tags_of(m).iter().any(|t| t == reference))
            .cloned()
            .ok_or_else(|| KitError::NotFound(reference.to_string()))
    }

    /// Add a manifest if it is not already present. Does not save.
    pub fn add_manifest(&mut self, desc: &Descriptor) {
        if !self.exists(desc) {
            let mut desc = desc.clone();
            desc.annotations = None;
            self.manifests.push(desc);
        }
    }

    /// Point `tag` at `desc`, removing it from any other manifest first
    /// (a tag names at most one digest).
    pub fn tag(&mut self, desc: &Descriptor, tag: &str) -> Result<()> {
        if !self.exists(desc) {
            self.add_manifest(desc);
        }
        for manifest in &mut self.manifests {
            let mut tags = tags_of(manifest);
            if manifest.digest == desc.digest {
                if !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            } else {
                tags.retain(|t| t != tag);
            }
            set_tags(manifest, tags);
        }
        Ok(())
    }

    pub fn untag(&mut self, tag: &str) -> Result<()> {
        let mut found = false;
        for manifest in &mut self.manifests {
            let mut tags = tags_of(manifest);
            let before = tags.len();
            tags.retain(|t| t != tag);
            if tags.len() != before {
                found = true;
                set_tags(manifest, tags);
            }
        }
        if !found {
            return Err(KitError::NotFound(tag.to_string()));
        }
        Ok(())
    }

    /// Remove a manifest entry. Returns whether it was present.
    pub fn delete(&mut self, desc: &Descriptor) -> bool {
        let before = self.manifests.len();
        self.manifests.retain(|m| m.digest != desc.digest);
        self.manifests.len() != before
    }

    pub fn list_tags(&self, desc: &Descriptor) -> Vec<String> {
        self.manifests
            .iter()
            .find(|m| m.digest == desc.digest)
            .map(tags_of)
            .unwrap_or_default()
    }
}

fn tags_of(desc: &Descriptor) -> Vec<String> {
    desc.annotations
        .as_ref()
        .and_then(|a| a.get(TAGS_ANNOTATION))
        .map(|v| v.split(',').filter(|t| !t.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

fn set_tags(desc: &mut Descriptor, tags: Vec<String>) {
    if tags.is_empty() {
        if let Some(annotations) = &mut desc.annotations {
            annotations.remove(TAGS_ANNOTATION);
            if annotations.is_empty() {
                desc.annotations = None;
            }
        }
        return;
    }
    desc.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(TAGS_ANNOTATION.to_string(), tags.join(","));
}

/// Whether any per-repository index other than `except_repo` references
/// the manifest. Used to refcount shared blobs before deletion.
pub fn referenced_elsewhere(
    storage_path: &Path,
    desc: &Descriptor,
    except_repo: &str,
) -> Result<bool> {
    let entries = match std::fs::read_dir(storage_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_local_index_filename(name) {
            continue;
        }
        let index = ManifestIndex::load(entry.path(), None)?;
        if index.repository() == Some(except_repo) {
            continue;
        }
        if index.exists(desc) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Enumerate every per-repository index under a storage root, sorted by
/// repository name.
pub fn all_repo_indexes(storage_path: &Path) -> Result<Vec<ManifestIndex>> {
    let entries = match std::fs::read_dir(storage_path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut indexes = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_local_index_filename(name) {
            indexes.push(ManifestIndex::load(entry.path(), None)?);
        }
    }
    indexes.sort_by(|a, b| a.repository().cmp(&b.repository()));
    Ok(indexes)
}
