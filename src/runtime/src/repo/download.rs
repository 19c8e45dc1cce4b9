//! Download sizing derived from host resources.

use sysinfo::System;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use kitops_core::{KitError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Tuning parameters for one pull operation.
#[derive(Debug, Clone, Copy)]
pub struct DownloadConfig {
    /// Buffer size for stream copies.
    pub copy_buffer_size: usize,
    /// Blobs larger than this are downloaded sequentially and chunked.
    pub large_layer_threshold: u64,
    /// Byte length of a single range-request chunk.
    pub chunk_size: u64,
    /// Concurrent range workers within one large blob.
    pub chunk_concurrency: usize,
    /// Concurrent whole-blob downloads for the small set.
    pub layer_concurrency: usize,
    /// Sample early-chunk throughput and resize the copy buffer.
    pub adaptive_buffer: bool,
}

impl DownloadConfig {
    /// Derive a configuration from CPU count and total system memory.
    pub fn detect() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(4);
        let mut sys = System::new();
        sys.refresh_memory();
        let mem = match sys.total_memory() {
            0 => 16 * GIB,
            m => m,
        };
        Self::for_resources(cpus, mem)
    }

    /// Sizing table, clamped to host-realistic bounds.
    pub fn for_resources(cpus: u64, mem: u64) -> Self {
        let max_buffer = if mem < 64 * GIB { 16 * MIB } else { 256 * MIB };
        let copy_buffer_size = (mem / 1000).clamp(MIB, max_buffer) as usize;
        let large_layer_threshold = (mem / 200).clamp(10 * MIB, GIB);
        let chunk_size = (mem / 50).min(32 * MIB * cpus).clamp(10 * MIB, 2 * GIB);
        let chunk_concurrency = (mem / (100 * MIB)).max(8 * cpus).clamp(4, 512) as usize;
        let layer_concurrency = (mem / (512 * MIB)).max(4 * cpus).clamp(4, 256) as usize;
        Self {
            copy_buffer_size,
            large_layer_threshold,
            chunk_size,
            chunk_concurrency,
            layer_concurrency,
            adaptive_buffer: true,
        }
    }

    /// Chunk size adjusted for one blob: very large blobs get larger
    /// chunks, smaller blobs get smaller ones. Chunk sizes below the
    /// derived minimum are taken as-is.
    pub fn chunk_size_for(&self, blob_size: u64) -> u64 {
        if blob_size > 10 * GIB {
            (self.chunk_size * 2).min(400 * MIB)
        } else if blob_size < 500 * MIB && self.chunk_size >= 10 * MIB {
            (self.chunk_size / 2).max(5 * MIB)
        } else {
            self.chunk_size
        }
    }
}

/// Buffer bounds for adaptive tuning.
pub(crate) const ADAPTIVE_BUFFER_MAX: usize = (32 * MIB) as usize;
pub(crate) const ADAPTIVE_BUFFER_MIN: usize = (32 * KIB) as usize;

/// Bandwidth thresholds (bytes/second) that trigger buffer resizing.
pub(crate) const FAST_LINK_BPS: f64 = 20.0 * MIB as f64;
pub(crate) const SLOW_LINK_BPS: f64 = MIB as f64;

/// Record a task failure, keeping the most informative error: the first
/// substantive failure wins over cancellations observed by its siblings.
pub(crate) fn record_error(first: &mut Option<KitError>, err: KitError) {
    match first {
        None => *first = Some(err),
        Some(KitError::Cancelled) if !matches!(err, KitError::Cancelled) => *first = Some(err),
        _ => {}
    }
}

/// Copy `reader` into `writer` with a bounded buffer, observing the
/// cancellation token at every read and reporting each chunk written.
///
/// Returns the number of bytes copied.
pub(crate) async fn copy_cancellable<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    buf_size: usize,
    token: &CancellationToken,
    mut on_chunk: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; buf_size];
    let mut copied: u64 = 0;
    loop {
        if token.is_cancelled() {
            return Err(KitError::Cancelled);
        }
        let n = tokio::select! {
            _ = token.cancelled() => return Err(KitError::Cancelled),
            n = reader.read(&mut buf) => n?,
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        on_chunk(&buf[..n]);
        copied += n as u64;
    }
    writer.flush().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_clamps_small_host() {
        // 2 CPUs, 4 GiB
        let config = DownloadConfig::for_resources(2, 4 * GIB);
        assert_eq!(config.copy_buffer_size as u64, 4 * GIB / 1000);
        assert_eq!(config.large_layer_threshold, 4 * GIB / 200);
        assert_eq!(config.chunk_size, 64 * MIB);
        assert_eq!(config.chunk_concurrency, 40);
        assert_eq!(config.layer_concurrency, 8);
    }

    #[test]
    fn test_table_clamps_tiny_host() {
        let config = DownloadConfig::for_resources(1, 512 * MIB);
        assert_eq!(config.copy_buffer_size as u64, MIB);
        assert_eq!(config.large_layer_threshold, 10 * MIB);
        assert_eq!(config.chunk_size, 512 * MIB / 50);
        assert_eq!(config.chunk_concurrency, 8);
        assert_eq!(config.layer_concurrency, 4);
    }

    #[test]
    fn test_table_clamps_huge_host() {
        // 128 CPUs, 2 TiB
        let config = DownloadConfig::for_resources(128, 2048 * GIB);
        assert!(config.copy_buffer_size as u64 <= 256 * MIB);
        assert_eq!(config.large_layer_threshold, GIB);
        assert!(config.chunk_size <= 2 * GIB);
        assert_eq!(config.chunk_concurrency, 512);
        assert_eq!(config.layer_concurrency, 256);
    }

    #[test]
    fn test_chunk_size_for_blob() {
        let config = DownloadConfig::for_resources(4, 16 * GIB);
        assert!(config.chunk_size_for(20 * GIB) > config.chunk_size);
        assert!(config.chunk_size_for(100 * MIB) < config.chunk_size);
        assert_eq!(config.chunk_size_for(GIB), config.chunk_size);
    }

    #[tokio::test]
    async fn test_copy_cancellable_copies_everything() {
        let data = vec![7u8; 100_000];
        let mut reader = std::io::Cursor::new(data.clone());
        let mut out = Vec::new();
        let token = CancellationToken::new();
        let mut seen = 0u64;
        let copied = copy_cancellable(&mut reader, &mut out, 4096, &token, |chunk| {
            seen += chunk.len() as u64;
        })
        .await
        .unwrap();
        assert_eq!(copied, 100_000);
        assert_eq!(seen, 100_000);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_copy_cancellable_observes_token() {
        let data = vec![7u8; 100_000];
        let mut reader = std::io::Cursor::new(data);
        let mut out = Vec::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = copy_cancellable(&mut reader, &mut out, 4096, &token, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, KitError::Cancelled));
    }
}
