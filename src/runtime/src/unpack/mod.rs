//! Typed layer unpacker.
//!
//! Drives a filtered extraction of a ModelKit's layers from the local
//! store into a target directory. A ModelKit whose `model.path` is a
//! reference extends a parent ModelKit: the parent's model layers are
//! unpacked first (code, datasets, and docs are not inherited), with
//! cycle detection and a bounded chain depth.

mod extract;
mod filter;

pub use extract::verify_subpath;
pub use filter::{derive_parent_filters, parse_filter, should_unpack, FilterConf, FilterTarget};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;

use kitops_core::config::MAX_MODEL_REF_CHAIN;
use kitops_core::kitfile::DEFAULT_KITFILE_NAME;
use kitops_core::oci::{BaseType, LayerCompression, ModelKitMediaType, MEDIA_TYPE_MODELKIT_CONFIG};
use kitops_core::progress::Progress;
use kitops_core::reference::is_model_reference;
use kitops_core::{Descriptor, Kitfile, KitError, ModelReference, Result};

use crate::repo::LocalRepo;

/// Options for an unpack operation.
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    pub model_ref: ModelReference,
    pub unpack_dir: PathBuf,
    pub filters: Vec<FilterConf>,
    pub overwrite: bool,
    pub ignore_existing: bool,
}

/// Unpack the ModelKit at `opts.model_ref` from the local store.
pub async fn unpack_modelkit(
    storage_path: &Path,
    opts: &UnpackOptions,
    progress: Arc<dyn Progress>,
) -> Result<()> {
    unpack_recursive(storage_path, opts.clone(), Vec::new(), progress).await
}

fn unpack_recursive(
    storage_path: &Path,
    opts: UnpackOptions,
    visited: Vec<String>,
    progress: Arc<dyn Progress>,
) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        if visited.len() > MAX_MODEL_REF_CHAIN {
            return Err(KitError::ReferenceChainTooLong(visited.join("=>")));
        }

        std::fs::create_dir_all(&opts.unpack_dir)?;
        let repo = LocalRepo::open(storage_path, &opts.model_ref.repo_name())?;
        let desc = repo.resolve(&opts.model_ref.reference()).await?;
        let manifest = repo.get_manifest(&desc).await?;
        if !manifest.is_modelkit() {
            return Err(KitError::WrongMediaType {
                expected: MEDIA_TYPE_MODELKIT_CONFIG.to_string(),
                actual: manifest.config.media_type.clone(),
            });
        }
        let kitfile = repo.get_kitfile(&manifest).await?;

        if let Some(model) = &kitfile.model {
            if is_model_reference(&model.path) {
                progress.info(&format!("unpacking referenced modelkit {}", model.path));
                unpack_parent(storage_path, &model.path, &opts, &visited, progress.clone())
                    .await?;
            }
        }

        if should_unpack(&FilterTarget::Config, &opts.filters) {
            unpack_config(&kitfile, &opts.unpack_dir, opts.overwrite, progress.as_ref())?;
        }

        // Layers appear in manifest order; entries of each base type are
        // consumed in lockstep with the Kitfile's lists.
        let mut part_idx = 0;
        let mut code_idx = 0;
        let mut dataset_idx = 0;
        let mut docs_idx = 0;
        for layer in &manifest.layers {
            let media_type = ModelKitMediaType::parse(&layer.media_type)?;
            let entry = match media_type.base {
                BaseType::Model => {
                    let model = kitfile
                        .model
                        .as_ref()
                        .ok_or_else(|| mismatch(BaseType::Model))?;
                    if !should_unpack(&FilterTarget::Model(model), &opts.filters) {
                        continue;
                    }
                    progress.info(&format!(
                        "unpacking model {} to {}",
                        model.name,
                        opts.unpack_dir.display()
                    ));
                    (model.layer_info.clone(), model.path.clone())
                }
                BaseType::ModelPart => {
                    let parts = kitfile.model.as_ref().map(|m| &m.parts[..]).unwrap_or(&[]);
                    let part = parts.get(part_idx).ok_or_else(|| mismatch(BaseType::ModelPart))?;
                    part_idx += 1;
                    if !should_unpack(&FilterTarget::ModelPart(part), &opts.filters) {
                        continue;
                    }
                    progress.info(&format!("unpacking model part {} to {}", part.name, part.path));
                    (part.layer_info.clone(), part.path.clone())
                }
                BaseType::Code => {
                    let code = kitfile.code.get(code_idx).ok_or_else(|| mismatch(BaseType::Code))?;
                    code_idx += 1;
                    if !should_unpack(&FilterTarget::Code(code), &opts.filters) {
                        continue;
                    }
                    progress.info(&format!("unpacking code to {}", code.path));
                    (code.layer_info.clone(), code.path.clone())
                }
                BaseType::Dataset => {
                    let dataset = kitfile
                        .datasets
                        .get(dataset_idx)
                        .ok_or_else(|| mismatch(BaseType::Dataset))?;
                    dataset_idx += 1;
                    if !should_unpack(&FilterTarget::Dataset(dataset), &opts.filters) {
                        continue;
                    }
                    progress.info(&format!("unpacking dataset {} to {}", dataset.name, dataset.path));
                    (dataset.layer_info.clone(), dataset.path.clone())
                }
                BaseType::Docs => {
                    let docs = kitfile.docs.get(docs_idx).ok_or_else(|| mismatch(BaseType::Docs))?;
                    docs_idx += 1;
                    if !should_unpack(&FilterTarget::Docs(docs), &opts.filters) {
                        continue;
                    }
                    progress.info(&format!("unpacking docs to {}", docs.path));
                    (docs.layer_info.clone(), docs.path.clone())
                }
                BaseType::Config => {
                    return Err(KitError::WrongMediaType {
                        expected: "a modelkit layer".to_string(),
                        actual: layer.media_type.clone(),
                    })
                }
            };

            // Modern layers embed their paths in the tar and extract
            // relative to the unpack dir; legacy layers (no LayerInfo)
            // carry an entry-defined path that must stay inside it.
            let (layer_info, entry_path) = entry;
            let extract_dir = match &layer_info {
                Some(info) => {
                    if info.digest != layer.digest {
                        return Err(mismatch(media_type.base));
                    }
                    opts.unpack_dir.clone()
                }
                None => {
                    let full = verify_subpath(&opts.unpack_dir, &entry_path)?;
                    full.parent().map(Path::to_path_buf).unwrap_or_else(|| opts.unpack_dir.clone())
                }
            };

            unpack_layer(
                &repo,
                layer,
                &extract_dir,
                media_type.compression,
                &opts,
                progress.clone(),
            )
            .await?;
        }
        progress.debug(&format!(
            "unpacked {part_idx} model part, {code_idx} code, {dataset_idx} dataset, {docs_idx} docs layers"
        ));
        Ok(())
    })
}

async fn unpack_parent(
    storage_path: &Path,
    parent_path: &str,
    child_opts: &UnpackOptions,
    visited: &[String],
    progress: Arc<dyn Progress>,
) -> Result<()> {
    if let Some(idx) = visited.iter().position(|r| r == parent_path) {
        let mut cycle: Vec<&str> = visited[idx..].iter().map(String::as_str).collect();
        cycle.push(parent_path);
        return Err(KitError::ReferenceCycle(format!("[{}]", cycle.join("=>"))));
    }

    let Some(filters) = derive_parent_filters(&child_opts.filters) else {
        // The child's filters exclude models; the parent has nothing to add.
        return Ok(());
    };
    let parent_ref = ModelReference::parse(parent_path)?;
    let opts = UnpackOptions {
        model_ref: parent_ref,
        filters,
        ..child_opts.clone()
    };

    let mut visited = visited.to_vec();
    visited.push(parent_path.to_string());
    unpack_recursive(storage_path, opts, visited, progress).await
}

/// Materialize the Kitfile at `unpack_dir/Kitfile`. An identical existing
/// file is accepted; a differing one fails unless overwriting.
fn unpack_config(
    kitfile: &Kitfile,
    unpack_dir: &Path,
    overwrite: bool,
    progress: &dyn Progress,
) -> Result<()> {
    let config_bytes = kitfile.to_yaml()?;
    let config_path = unpack_dir.join(DEFAULT_KITFILE_NAME);
    if let Ok(metadata) = std::fs::symlink_metadata(&config_path) {
        if !metadata.is_file() {
            return Err(KitError::Conflict { path: config_path });
        }
        if !overwrite {
            let existing = std::fs::read(&config_path)?;
            if existing == config_bytes {
                progress.info(&format!(
                    "found existing Kitfile at {}",
                    config_path.display()
                ));
                return Ok(());
            }
            return Err(KitError::Conflict { path: config_path });
        }
    }

    progress.info(&format!("unpacking config to {}", config_path.display()));
    std::fs::create_dir_all(unpack_dir)?;
    std::fs::write(&config_path, config_bytes)?;
    Ok(())
}

async fn unpack_layer(
    repo: &LocalRepo,
    layer: &Descriptor,
    extract_dir: &Path,
    compression: LayerCompression,
    opts: &UnpackOptions,
    progress: Arc<dyn Progress>,
) -> Result<()> {
    // Extraction is filesystem-bound; run it off the async workers.
    let blob_path = repo.blob_path(layer);
    if !repo.exists(layer).await? {
        return Err(KitError::NotFound(layer.digest.to_string()));
    }
    std::fs::create_dir_all(extract_dir)?;

    let layer = layer.clone();
    let extract_dir = extract_dir.to_path_buf();
    let overwrite = opts.overwrite;
    let ignore_existing = opts.ignore_existing;
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&blob_path)?;
        progress.begin_blob(&layer.digest, layer.size, 0);
        let result = match compression {
            LayerCompression::Gzip | LayerCompression::GzipFastest => extract::extract_tar(
                flate2::read::GzDecoder::new(file),
                &extract_dir,
                overwrite,
                ignore_existing,
                progress.as_ref(),
                &layer.digest,
            ),
            LayerCompression::None => extract::extract_tar(
                file,
                &extract_dir,
                overwrite,
                ignore_existing,
                progress.as_ref(),
                &layer.digest,
            ),
        };
        progress.finish_blob(&layer.digest);
        result
    })
    .await
    .map_err(|e| KitError::Io(std::io::Error::other(e)))?
}

fn mismatch(base: BaseType) -> KitError {
    KitError::ManifestConfigMismatch {
        base_type: base.to_string(),
    }
}
