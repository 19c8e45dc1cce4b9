//! Concurrent pull engine.
//!
//! Downloads a manifest's closure from a remote target into the local
//! store. Blobs at or below the large-layer threshold are fetched in
//! parallel under a bounded semaphore; larger blobs are fetched one at a
//! time so each gets the full link, chunked into parallel range requests
//! when the remote supports them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use kitops_core::config::ingest_path;
use kitops_core::oci::MEDIA_TYPE_IMAGE_MANIFEST;
use kitops_core::progress::Progress;
use kitops_core::{Descriptor, KitError, Manifest, ModelReference, Result};

use super::download::{
    copy_cancellable, record_error, DownloadConfig, ADAPTIVE_BUFFER_MAX, ADAPTIVE_BUFFER_MIN,
    FAST_LINK_BPS, SLOW_LINK_BPS,
};
use super::store::{set_blob_permissions, LocalRepo};
use crate::remote::{RemoteBlob, RemoteTarget, SeekableBlob};

/// Options for a pull operation.
#[derive(Default)]
pub struct PullOptions {
    /// Bound on concurrent small-blob downloads; defaults to the derived
    /// layer concurrency.
    pub concurrency: Option<usize>,
    /// Download sizing override; defaults to host-derived values.
    pub download: Option<DownloadConfig>,
}

impl LocalRepo {
    /// Pull the ModelKit at `reference` from `src` into the local store.
    ///
    /// Returns the manifest descriptor. On success the manifest is
    /// registered in the per-repository index, tagged by its own digest
    /// in the shared index, and — when the reference is a tag — the tag
    /// mapping is recorded.
    pub async fn pull_model(
        &self,
        src: Arc<dyn RemoteTarget>,
        reference: &ModelReference,
        opts: PullOptions,
        progress: Arc<dyn Progress>,
        token: CancellationToken,
    ) -> Result<Descriptor> {
        let desc = src.resolve(&reference.reference()).await?;
        if desc.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
            return Err(KitError::WrongMediaType {
                expected: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
                actual: desc.media_type,
            });
        }
        self.ensure_dirs(&desc)?;

        // Cache-first: a manifest already in this repository's index is
        // read locally; nothing is fetched for an up-to-date kit.
        let manifest = if self.exists(&desc).await? {
            self.get_manifest(&desc).await?
        } else {
            fetch_manifest(src.as_ref(), &desc).await?
        };
        let config = opts.download.unwrap_or_else(DownloadConfig::detect);
        progress.debug(&format!(
            "download config: buffer={}KiB threshold={}MiB chunk={}MiB concurrency={}",
            config.copy_buffer_size / 1024,
            config.large_layer_threshold / (1024 * 1024),
            config.chunk_size / (1024 * 1024),
            config.layer_concurrency,
        ));
        let concurrency = opts
            .concurrency
            .filter(|&n| n > 0)
            .unwrap_or(config.layer_concurrency)
            .max(1);

        // Build the pull set: config + layers + the manifest itself,
        // deduplicated by digest. Some ModelKits list the same blob twice;
        // downloading it concurrently would race on the ingest file.
        let mut seen = HashSet::new();
        let mut to_pull = Vec::with_capacity(manifest.layers.len() + 2);
        for candidate in std::iter::once(&manifest.config)
            .chain(manifest.layers.iter())
            .chain(std::iter::once(&desc))
        {
            if seen.insert(candidate.digest.as_str().to_string()) {
                to_pull.push(candidate.clone());
            }
        }

        let (small, large): (Vec<_>, Vec<_>) = to_pull
            .into_iter()
            .partition(|d| d.size <= config.large_layer_threshold);

        let downloader = Arc::new(Downloader {
            repo_storage: self.storage_path().to_path_buf(),
            src,
            config,
            progress: progress.clone(),
            token: token.clone(),
        });

        // Step 1: small blobs concurrently.
        if !small.is_empty() {
            progress.debug(&format!(
                "downloading {} small blobs with {concurrency} workers",
                small.len()
            ));
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut tasks = JoinSet::new();
            for desc in small {
                if token.is_cancelled() {
                    break;
                }
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| KitError::Cancelled)?;
                let downloader = downloader.clone();
                let repo_exists = self.exists(&desc).await?;
                let token = token.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    if repo_exists {
                        return Ok(());
                    }
                    let result = downloader.pull_blob(&desc).await;
                    if result.is_err() {
                        // Abort the siblings; the first error wins.
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
        }

        // Step 2: large blobs sequentially, so each gets full bandwidth.
        if !large.is_empty() {
            progress.debug(&format!(
                "downloading {} large blobs sequentially",
                large.len()
            ));
            for desc in large {
                if self.exists(&desc).await? {
                    continue;
                }
                downloader.pull_blob(&desc).await?;
            }
        }

        self.register_manifest(&desc).await?;
        if !reference.is_digest_reference() {
            if let Some(tag) = &reference.tag {
                self.tag(&desc, tag).await?;
            }
        }

        if let Err(e) = self.cleanup_ingest_dir() {
            progress.log(
                kitops_core::LogLevel::Warn,
                &format!("failed to clean up ingest directory: {e}"),
            );
        }
        Ok(desc)
    }
}

/// Fetch and parse a manifest from the remote. Manifests are small and
/// handled as a single stream.
async fn fetch_manifest(src: &dyn RemoteTarget, desc: &Descriptor) -> Result<Manifest> {
    let mut data = Vec::with_capacity(desc.size as usize);
    match src.fetch(desc).await? {
        RemoteBlob::Streaming(mut reader) => {
            reader.read_to_end(&mut data).await?;
        }
        RemoteBlob::Seekable(blob) => {
            let mut reader = blob.reader_at(0, None).await?;
            reader.read_to_end(&mut data).await?;
        }
    }
    Manifest::from_bytes(&data)
}

/// Shared state for the per-blob download tasks of one pull.
struct Downloader {
    repo_storage: PathBuf,
    src: Arc<dyn RemoteTarget>,
    config: DownloadConfig,
    progress: Arc<dyn Progress>,
    token: CancellationToken,
}

impl Downloader {
    fn blob_path(&self, desc: &Descriptor) -> PathBuf {
        super::store::blob_path(&self.repo_storage, desc)
    }

    fn ingest_dir(&self) -> PathBuf {
        ingest_path(&self.repo_storage)
    }

    /// Download one blob, choosing a strategy from its size and the
    /// remote's range support.
    async fn pull_blob(&self, desc: &Descriptor) -> Result<()> {
        if self.blob_path(desc).is_file() {
            return Ok(());
        }
        match self.src.fetch(desc).await? {
            RemoteBlob::Seekable(blob) if desc.size > self.config.large_layer_threshold => {
                let blob: Arc<dyn SeekableBlob> = Arc::from(blob);
                self.download_chunked(desc, blob).await
            }
            RemoteBlob::Seekable(blob) => self.download_resumable(desc, blob.as_ref()).await,
            RemoteBlob::Streaming(reader) => self.download_streaming(desc, reader).await,
        }
    }

    /// Single-stream download into a uniquely named ingest file. The
    /// ingest file is removed on any failure.
    async fn download_streaming(
        &self,
        desc: &Descriptor,
        mut reader: crate::remote::ByteReader,
    ) -> Result<()> {
        let ingest = tempfile::Builder::new()
            .prefix(&format!("{}_", desc.digest.encoded()))
            .tempfile_in(self.ingest_dir())?;
        let mut file = tokio::fs::File::from_std(ingest.as_file().try_clone()?);

        let mut verifier = desc.digest.verifier()?;
        self.progress.begin_blob(&desc.digest, desc.size, 0);
        let progress = &self.progress;
        let copied = copy_cancellable(
            &mut reader,
            &mut file,
            self.config.copy_buffer_size,
            &self.token,
            |chunk| {
                verifier.update(chunk);
                progress.blob_bytes(&desc.digest, chunk.len() as u64);
            },
        )
        .await?;
        self.progress.finish_blob(&desc.digest);
        if copied != desc.size {
            return Err(KitError::SizeMismatch {
                digest: desc.digest.to_string(),
                expected: desc.size,
                actual: copied,
            });
        }
        verifier.verify()?;

        drop(file);
        let persisted = ingest
            .persist(self.blob_path(desc))
            .map_err(|e| KitError::Io(e.error))?;
        set_blob_permissions(&persisted)?;
        Ok(())
    }

    /// Resumable download into an ingest file named by the digest. An
    /// existing partial file is hashed to recover the byte offset, then
    /// the source is opened at that offset. Transport failures leave the
    /// partial file for the next attempt; verification failures remove it.
    async fn download_resumable(&self, desc: &Descriptor, blob: &dyn SeekableBlob) -> Result<()> {
        let ingest_path = self.ingest_dir().join(desc.digest.encoded());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&ingest_path)
            .await?;

        let mut verifier = desc.digest.verifier()?;
        let mut offset: u64 = 0;
        let existing = file.metadata().await?.len();
        if existing > 0 {
            self.progress
                .debug(&format!("resuming download for digest {}", desc.digest));
            let mut buf = vec![0u8; self.config.copy_buffer_size];
            file.seek(std::io::SeekFrom::Start(0)).await?;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                verifier.update(&buf[..n]);
                offset += n as u64;
            }
        }

        let mut reader = blob.reader_at(offset, None).await?;
        self.progress.begin_blob(&desc.digest, desc.size, offset);
        let progress = &self.progress;
        let copied = copy_cancellable(
            &mut reader,
            &mut file,
            self.config.copy_buffer_size,
            &self.token,
            |chunk| {
                verifier.update(chunk);
                progress.blob_bytes(&desc.digest, chunk.len() as u64);
            },
        )
        .await?;
        self.progress.finish_blob(&desc.digest);

        if offset + copied != desc.size {
            return Err(KitError::SizeMismatch {
                digest: desc.digest.to_string(),
                expected: desc.size,
                actual: offset + copied,
            });
        }
        if let Err(e) = verifier.verify() {
            // The partial bytes are bad; retrying from them cannot succeed.
            let _ = tokio::fs::remove_file(&ingest_path).await;
            return Err(e);
        }

        drop(file);
        self.promote(&ingest_path, desc).await
    }

    /// Chunked parallel download: pre-allocate the ingest file, fetch
    /// disjoint ranges concurrently, then verify the assembled file.
    async fn download_chunked(&self, desc: &Descriptor, blob: Arc<dyn SeekableBlob>) -> Result<()> {
        let ingest = tempfile::Builder::new()
            .prefix(&format!("{}_chunked_", desc.digest.encoded()))
            .tempfile_in(self.ingest_dir())?;
        ingest.as_file().set_len(desc.size)?;
        let ingest_path = ingest.path().to_path_buf();

        let chunk_size = self.config.chunk_size_for(desc.size);
        let num_chunks = desc.size.div_ceil(chunk_size);
        let concurrency = (self.config.chunk_concurrency as u64).min(num_chunks) as usize;
        let adaptive = self.config.adaptive_buffer && num_chunks > 5;
        self.progress.debug(&format!(
            "downloading {} in {num_chunks} chunks with {concurrency} workers ({}MiB each)",
            desc.digest,
            chunk_size / (1024 * 1024),
        ));

        self.progress.begin_blob(&desc.digest, desc.size, 0);
        // Best-effort throughput samples from the first chunks; the
        // channel is bounded and sends never block.
        let (speed_tx, speed_rx) = mpsc::channel::<f64>(5);
        let speed_rx = Arc::new(tokio::sync::Mutex::new(speed_rx));

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for index in 0..num_chunks {
            if self.token.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| KitError::Cancelled)?;
            let start = index * chunk_size;
            let length = chunk_size.min(desc.size - start);

            let blob = blob.clone();
            let token = self.token.clone();
            let progress = self.progress.clone();
            let digest = desc.digest.clone();
            let path = ingest_path.clone();
            let speed_tx = speed_tx.clone();
            let speed_rx = speed_rx.clone();
            let mut buf_size = self.config.copy_buffer_size;
            tasks.spawn(async move {
                let _permit = permit;
                let result = async {
                    if adaptive && index > 3 {
                        buf_size = adjusted_buffer_size(buf_size, &speed_rx).await;
                    }

                    let started = Instant::now();
                    let mut reader = blob.reader_at(start, Some(length)).await?;
                    let mut file =
                        tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                    file.seek(std::io::SeekFrom::Start(start)).await?;
                    let copied = copy_cancellable(
                        &mut reader,
                        &mut file,
                        buf_size,
                        &token,
                        |chunk| progress.blob_bytes(&digest, chunk.len() as u64),
                    )
                    .await?;
                    if copied != length {
                        return Err(KitError::SizeMismatch {
                            digest: digest.to_string(),
                            expected: length,
                            actual: copied,
                        });
                    }

                    if adaptive && index < 3 {
                        let elapsed = started.elapsed().as_secs_f64();
                        if elapsed > 0.0 {
                            let _ = speed_tx.try_send(copied as f64 / elapsed);
                        }
                    }
                    Ok(())
                }
                .await;
                if result.is_err() {
                    token.cancel();
                }
                result
            });
        }
        drop(speed_tx);

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| KitError::Transport(e.to_string()))?;
            if let Err(e) = result {
                record_error(&mut first_error, e);
            }
        }
        self.progress.finish_blob(&desc.digest);
        if let Some(e) = first_error {
            return Err(e);
        }

        // Verify the assembled file end to end before promotion.
        let mut file = tokio::fs::File::open(&ingest_path).await?;
        let mut verifier = desc.digest.verifier()?;
        let mut buf = vec![0u8; self.config.copy_buffer_size];
        loop {
            if self.token.is_cancelled() {
                return Err(KitError::Cancelled);
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            verifier.update(&buf[..n]);
        }
        verifier.verify()?;

        let persisted = ingest
            .persist(self.blob_path(desc))
            .map_err(|e| KitError::Io(e.error))?;
        set_blob_permissions(&persisted)?;
        Ok(())
    }

    /// Atomically move a verified ingest file into the blob store.
    async fn promote(&self, ingest_path: &std::path::Path, desc: &Descriptor) -> Result<()> {
        let blob_path = self.blob_path(desc);
        tokio::fs::rename(ingest_path, &blob_path).await?;
        let file = std::fs::File::open(&blob_path)?;
        set_blob_permissions(&file)?;
        Ok(())
    }
}

/// Resize the copy buffer from sampled chunk throughput: double it on a
/// fast link, halve it on a slow one.
async fn adjusted_buffer_size(
    buf_size: usize,
    speed_rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<f64>>>,
) -> usize {
    let mut samples = Vec::new();
    {
        let mut rx = speed_rx.lock().await;
        while samples.len() < 3 {
            match rx.try_recv() {
                Ok(sample) => samples.push(sample),
                Err(_) => break,
            }
        }
    }
    if samples.is_empty() {
        return buf_size;
    }
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    if avg > FAST_LINK_BPS {
        (buf_size * 2).min(ADAPTIVE_BUFFER_MAX)
    } else if avg < SLOW_LINK_BPS {
        (buf_size / 2).max(ADAPTIVE_BUFFER_MIN)
    } else {
        buf_size
    }
}
