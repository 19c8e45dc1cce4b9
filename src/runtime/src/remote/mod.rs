//! Remote OCI repository targets.
//!
//! A [`RemoteTarget`] is a capability over one remote repository: resolve
//! references, fetch and push blobs, enumerate tags. Fetch results are a
//! discriminated [`RemoteBlob`]: remotes that accept HTTP Range requests
//! return a seekable handle that can open independent readers at byte
//! offsets, which the pull engine uses for resumable and chunked
//! downloads. Seekability is advisory; callers must handle either variant.

mod registry;

pub use registry::{Registry, RegistryAuth, TransportOptions};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use kitops_core::{Descriptor, Result};

/// A boxed async byte reader.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// A page of tags from a paginated listing.
#[derive(Debug, Clone)]
pub struct TagPage {
    pub tags: Vec<String>,
    /// Cursor for the next page; `None` when exhausted.
    pub next: Option<String>,
}

/// A fetched remote blob, with or without range-read support.
pub enum RemoteBlob {
    /// Single-pass stream; the remote does not support ranges.
    Streaming(ByteReader),
    /// Range-capable handle; independent readers may be opened at offsets.
    Seekable(Box<dyn SeekableBlob>),
}

impl RemoteBlob {
    pub fn is_seekable(&self) -> bool {
        matches!(self, RemoteBlob::Seekable(_))
    }
}

/// A blob whose bytes can be read from arbitrary offsets.
///
/// Each [`SeekableBlob::reader_at`] call opens a fresh connection with an
/// HTTP Range request, so concurrent chunk workers do not share a cursor.
#[async_trait]
pub trait SeekableBlob: Send + Sync {
    /// Open a reader at `offset`, bounded to `length` bytes when given.
    async fn reader_at(&self, offset: u64, length: Option<u64>) -> Result<ByteReader>;
}

/// Read-only or read-write view of a remote OCI repository.
#[async_trait]
pub trait RemoteTarget: Send + Sync {
    /// Resolve a tag or digest string to a descriptor (HEAD request).
    async fn resolve(&self, reference: &str) -> Result<Descriptor>;

    /// Fetch the content of a descriptor.
    async fn fetch(&self, desc: &Descriptor) -> Result<RemoteBlob>;

    /// Whether the remote already has this content.
    async fn exists(&self, desc: &Descriptor) -> Result<bool>;

    /// Upload content for a descriptor; size and digest are known up front.
    /// Manifests pushed this way are addressed by digest.
    async fn push(&self, desc: &Descriptor, content: ByteReader) -> Result<()>;

    /// Upload a manifest under a tag or digest reference.
    async fn push_manifest(
        &self,
        reference: &str,
        desc: &Descriptor,
        content: Vec<u8>,
    ) -> Result<()>;

    /// Fetch one page of the repository's tag listing.
    async fn tags_page(&self, last: Option<String>) -> Result<TagPage>;
}
