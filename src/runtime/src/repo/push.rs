//! Push engine: copy a local ModelKit's closure to a remote target.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kitops_core::config::UPLOAD_CONCURRENCY_ENV;
use kitops_core::oci::MEDIA_TYPE_IMAGE_MANIFEST;
use kitops_core::progress::Progress;
use kitops_core::{Descriptor, KitError, ModelReference, Result};

use super::download::record_error;
use super::store::LocalRepo;
use crate::remote::RemoteTarget;

/// Default upload concurrency: four per CPU, clamped to [4, 64].
/// Overridable via `KITOPS_UPLOAD_CONCURRENCY`.
pub fn default_upload_concurrency() -> usize {
    if let Ok(value) = std::env::var(UPLOAD_CONCURRENCY_ENV) {
        if let Ok(n) = value.parse::<usize>() {
            if n > 0 {
                return n;
            }
        }
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 4).clamp(4, 64)
}

/// Options for a push operation.
#[derive(Default)]
pub struct PushOptions {
    /// Bound on concurrent blob uploads; defaults to
    /// [`default_upload_concurrency`].
    pub concurrency: Option<usize>,
}

impl LocalRepo {
    /// Push the ModelKit at `reference` to `dest`.
    ///
    /// Copies the manifest's config and layers first, then the manifest
    /// itself under the reference's tag (or digest). Blobs already on the
    /// remote are skipped. Local blobs are digest-verified as they are
    /// read, so a corrupted store fails with `DigestMismatch` before the
    /// manifest goes live.
    pub async fn push_model(
        &self,
        dest: Arc<dyn RemoteTarget>,
        reference: &ModelReference,
        opts: PushOptions,
        progress: Arc<dyn Progress>,
        token: CancellationToken,
    ) -> Result<Descriptor> {
        let desc = self.resolve(&reference.reference()).await?;
        if desc.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
            return Err(KitError::WrongMediaType {
                expected: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                actual: desc.media_type,
            });
        }
        let manifest = self.get_manifest(&desc).await?;
        let concurrency = opts
            .concurrency
            .filter(|&n| n > 0)
            .unwrap_or_else(default_upload_concurrency);

        // Copy the closure, dedup'd by digest: config plus layers.
        let mut to_push: Vec<Descriptor> = Vec::with_capacity(manifest.layers.len() + 1);
        for candidate in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if !to_push.iter().any(|d| d.digest == candidate.digest) {
                to_push.push(candidate.clone());
            }
        }
        progress.debug(&format!(
            "pushing {} blobs with {concurrency} workers",
            to_push.len()
        ));

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for blob_desc in to_push {
            if token.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| KitError::Cancelled)?;
            let dest = dest.clone();
            let token = token.clone();
            let progress = progress.clone();
            let path = self.blob_path(&blob_desc);
            tasks.spawn(async move {
                let _permit = permit;
                let result = async {
                    if token.is_cancelled() {
                        return Err(KitError::Cancelled);
                    }
                    // Verify the local bytes before anything leaves the
                    // machine; a corrupted store must not reach the remote.
                    verify_blob_file(&path, &blob_desc).await?;
                    if dest.exists(&blob_desc).await? {
                        progress.debug(&format!("{} already on remote", blob_desc.digest));
                        return Ok(());
                    }
                    progress.begin_blob(&blob_desc.digest, blob_desc.size, 0);
                    let file = tokio::fs::File::open(&path).await?;
                    dest.push(&blob_desc, Box::new(file)).await?;
                    progress.blob_bytes(&blob_desc.digest, blob_desc.size);
                    progress.finish_blob(&blob_desc.digest);
                    Ok(())
                }
                .await;
                if result.is_err() {
                    token.cancel();
                }
                result
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| KitError::Transport(e.to_string()))?;
            if let Err(e) = result {
                record_error(&mut first_error, e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if token.is_cancelled() {
            return Err(KitError::Cancelled);
        }

        // Manifest last, so a partially pushed kit is never resolvable.
        let manifest_bytes = self.fetch_bytes(&desc).await?;
        let mut verifier = desc.digest.verifier()?;
        verifier.update(&manifest_bytes);
        verifier.verify()?;
        dest.push_manifest(&reference.reference(), &desc, manifest_bytes)
            .await?;
        Ok(desc)
    }
}

/// Stream a blob file through a digest verifier without keeping it in
/// memory.
async fn verify_blob_file(path: &std::path::Path, desc: &Descriptor) -> Result<()> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(KitError::NotFound(desc.digest.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut verifier = desc.digest.verifier()?;
    let mut size: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]);
        size += n as u64;
    }
    if size != desc.size {
        return Err(KitError::SizeMismatch {
            digest: desc.digest.to_string(),
            expected: desc.size,
            actual: size,
        });
    }
    verifier.verify()
}
