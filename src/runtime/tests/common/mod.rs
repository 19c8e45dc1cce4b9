//! Shared fixtures: an in-memory remote target and ModelKit builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use kitops_core::kitfile::{Code, Dataset, Docs, Kitfile, LayerInfo, Model, Package};
use kitops_core::oci::{ContentDigest, MEDIA_TYPE_MODELKIT_CONFIG};
use kitops_core::{Descriptor, KitError, Manifest, Result};
use kitops_runtime::remote::{ByteReader, RemoteBlob, RemoteTarget, SeekableBlob, TagPage};
use kitops_runtime::LocalRepo;

/// In-memory remote repository for pull/push tests.
#[derive(Default)]
pub struct MockRemote {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    manifests: Mutex<HashMap<String, Descriptor>>,
    /// Advertise range support on fetched blobs.
    pub seekable: bool,
    fetches: AtomicUsize,
    pushed_blobs: Mutex<Vec<String>>,
    pushed_manifests: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new(seekable: bool) -> Self {
        Self {
            seekable,
            ..Default::default()
        }
    }

    /// Store blob bytes addressed by digest.
    pub fn put_blob(&self, data: &[u8]) -> ContentDigest {
        let digest = ContentDigest::from_content(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.as_str().to_string(), data.to_vec());
        digest
    }

    /// Store blob bytes under an unrelated digest, simulating corruption.
    pub fn put_blob_at(&self, digest: &ContentDigest, data: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.as_str().to_string(), data.to_vec());
    }

    /// Register a manifest under a tag (and its own digest).
    pub fn put_manifest(&self, tag: &str, desc: &Descriptor, data: &[u8]) {
        self.put_blob(data);
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(tag.to_string(), desc.clone());
        manifests.insert(desc.digest.as_str().to_string(), desc.clone());
    }

    /// Total number of fetch calls (manifest resolution excluded).
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn pushed_blob_count(&self) -> usize {
        self.pushed_blobs.lock().unwrap().len()
    }

    pub fn pushed_manifests(&self) -> Vec<String> {
        self.pushed_manifests.lock().unwrap().clone()
    }

    pub fn has_blob(&self, digest: &ContentDigest) -> bool {
        self.blobs.lock().unwrap().contains_key(digest.as_str())
    }
}

struct MockSeekableBlob {
    data: Vec<u8>,
}

#[async_trait]
impl SeekableBlob for MockSeekableBlob {
    async fn reader_at(&self, offset: u64, length: Option<u64>) -> Result<ByteReader> {
        let start = offset as usize;
        if start > self.data.len() {
            return Err(KitError::Transport("range out of bounds".to_string()));
        }
        let end = match length {
            Some(len) => (start + len as usize).min(self.data.len()),
            None => self.data.len(),
        };
        Ok(Box::new(std::io::Cursor::new(self.data[start..end].to_vec())))
    }
}

#[async_trait]
impl RemoteTarget for MockRemote {
    async fn resolve(&self, reference: &str) -> Result<Descriptor> {
        self.manifests
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| KitError::NotFound(reference.to_string()))
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<RemoteBlob> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(desc.digest.as_str())
            .cloned()
            .ok_or_else(|| KitError::NotFound(desc.digest.to_string()))?;
        if self.seekable && !desc.is_manifest() {
            Ok(RemoteBlob::Seekable(Box::new(MockSeekableBlob { data })))
        } else {
            Ok(RemoteBlob::Streaming(Box::new(std::io::Cursor::new(data))))
        }
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .contains_key(desc.digest.as_str()))
    }

    async fn push(&self, desc: &Descriptor, mut content: ByteReader) -> Result<()> {
        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        if ContentDigest::from_content(&data) != desc.digest {
            return Err(KitError::DigestMismatch {
                digest: desc.digest.to_string(),
            });
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(desc.digest.as_str().to_string(), data);
        self.pushed_blobs
            .lock()
            .unwrap()
            .push(desc.digest.as_str().to_string());
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &str,
        desc: &Descriptor,
        content: Vec<u8>,
    ) -> Result<()> {
        self.put_manifest(reference, desc, &content);
        self.pushed_manifests
            .lock()
            .unwrap()
            .push(reference.to_string());
        Ok(())
    }

    async fn tags_page(&self, _last: Option<String>) -> Result<TagPage> {
        let mut tags: Vec<String> = self
            .manifests
            .lock()
            .unwrap()
            .keys()
            .filter(|k| !k.starts_with("sha256:"))
            .cloned()
            .collect();
        tags.sort();
        Ok(TagPage { tags, next: None })
    }
}

/// Build an uncompressed tar archive from (name, content) pairs.
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        let name_bytes = name.as_bytes();
        let gnu = header.as_gnu_mut().unwrap();
        gnu.name[..name_bytes.len()].copy_from_slice(name_bytes);
        header.set_cksum();
        builder.append(&header, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// One layer of a kit under construction.
pub struct KitLayer {
    pub base: &'static str,
    pub name: String,
    pub path: String,
    pub tar: Vec<u8>,
}

impl KitLayer {
    pub fn model(name: &str, path: &str, files: &[(&str, &[u8])]) -> Self {
        Self {
            base: "model",
            name: name.to_string(),
            path: path.to_string(),
            tar: tar_bytes(files),
        }
    }

    pub fn dataset(name: &str, path: &str, files: &[(&str, &[u8])]) -> Self {
        Self {
            base: "dataset",
            name: name.to_string(),
            path: path.to_string(),
            tar: tar_bytes(files),
        }
    }

    pub fn code(path: &str, files: &[(&str, &[u8])]) -> Self {
        Self {
            base: "code",
            name: String::new(),
            path: path.to_string(),
            tar: tar_bytes(files),
        }
    }

    pub fn docs(path: &str, files: &[(&str, &[u8])]) -> Self {
        Self {
            base: "docs",
            name: String::new(),
            path: path.to_string(),
            tar: tar_bytes(files),
        }
    }

    fn media_type(&self) -> String {
        format!("application/vnd.kitops.modelkit.{}.v1.tar", self.base)
    }
}

/// A fully assembled ModelKit: serialized config, layers, and manifest.
pub struct BuiltKit {
    pub kitfile_yaml: Vec<u8>,
    pub config_desc: Descriptor,
    pub layers: Vec<(Descriptor, Vec<u8>)>,
    pub manifest_bytes: Vec<u8>,
    pub manifest_desc: Descriptor,
}

/// Assemble a ModelKit from layers, linking Kitfile entries to layer
/// digests through their LayerInfo.
pub fn build_kit(package_name: &str, model_path_override: Option<&str>, layers: Vec<KitLayer>) -> BuiltKit {
    let mut kitfile = Kitfile {
        manifest_version: "1.0".to_string(),
        package: Package {
            name: Some(package_name.to_string()),
            version: Some("0.1.0".to_string()),
            description: None,
            authors: vec!["ml-team".to_string()],
        },
        model: None,
        code: vec![],
        datasets: vec![],
        docs: vec![],
    };

    let mut layer_descs = Vec::new();
    let mut layer_blobs = Vec::new();
    for layer in &layers {
        let digest = ContentDigest::from_content(&layer.tar);
        let desc = Descriptor::new(layer.media_type(), digest.clone(), layer.tar.len() as u64);
        let info = Some(LayerInfo {
            digest,
            diff_id: None,
        });
        match layer.base {
            "model" => {
                kitfile.model = Some(Model {
                    name: layer.name.clone(),
                    path: model_path_override
                        .map(str::to_string)
                        .unwrap_or_else(|| layer.path.clone()),
                    framework: None,
                    version: None,
                    description: None,
                    parts: vec![],
                    layer_info: info,
                });
            }
            "dataset" => kitfile.datasets.push(Dataset {
                name: layer.name.clone(),
                path: layer.path.clone(),
                description: None,
                license: None,
                layer_info: info,
            }),
            "code" => kitfile.code.push(Code {
                path: layer.path.clone(),
                description: None,
                license: None,
                layer_info: info,
            }),
            "docs" => kitfile.docs.push(Docs {
                path: layer.path.clone(),
                description: None,
                layer_info: info,
            }),
            other => panic!("unknown layer base {other}"),
        }
        layer_descs.push(desc.clone());
        layer_blobs.push((desc, layer.tar.clone()));
    }

    // A kit that only extends a parent has no model layer of its own.
    if kitfile.model.is_none() {
        if let Some(parent) = model_path_override {
            kitfile.model = Some(Model {
                name: "parent".to_string(),
                path: parent.to_string(),
                framework: None,
                version: None,
                description: None,
                parts: vec![],
                layer_info: None,
            });
        }
    }

    let kitfile_yaml = kitfile.to_yaml().unwrap();
    let config_desc = Descriptor::new(
        MEDIA_TYPE_MODELKIT_CONFIG,
        ContentDigest::from_content(&kitfile_yaml),
        kitfile_yaml.len() as u64,
    );

    let manifest = Manifest::new(config_desc.clone(), layer_descs);
    let manifest_bytes = manifest.to_bytes().unwrap();
    let manifest_desc = Descriptor::for_manifest_bytes(&manifest_bytes);

    BuiltKit {
        kitfile_yaml,
        config_desc,
        layers: layer_blobs,
        manifest_bytes,
        manifest_desc,
    }
}

impl BuiltKit {
    /// Register every blob of this kit in a mock remote under `tag`.
    pub fn seed_remote(&self, remote: &MockRemote, tag: &str) {
        remote.put_blob(&self.kitfile_yaml);
        for (_, data) in &self.layers {
            remote.put_blob(data);
        }
        remote.put_manifest(tag, &self.manifest_desc, &self.manifest_bytes);
    }

    /// Store every blob of this kit in a local repository under `tag`.
    pub async fn seed_local(&self, repo: &LocalRepo, tag: &str) {
        repo.push(&self.config_desc, boxed_reader(&self.kitfile_yaml))
            .await
            .unwrap();
        for (desc, data) in &self.layers {
            // Duplicate layers share a blob
            if !repo.exists(desc).await.unwrap() {
                repo.push(desc, boxed_reader(data)).await.unwrap();
            }
        }
        repo.push(&self.manifest_desc, boxed_reader(&self.manifest_bytes))
            .await
            .unwrap();
        repo.tag(&self.manifest_desc, tag).await.unwrap();
    }
}

pub fn boxed_reader(data: &[u8]) -> ByteReader {
    Box::new(std::io::Cursor::new(data.to_vec()))
}

/// Shorthand for the Arc<dyn Progress> the engines expect.
pub fn null_progress() -> Arc<dyn kitops_core::Progress> {
    Arc::new(kitops_core::progress::NullProgress)
}
