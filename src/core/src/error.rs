use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for ModelKit storage and transfer operations.
#[derive(Error, Debug)]
pub enum KitError {
    /// A reference or descriptor could not be resolved
    #[error("not found: {0}")]
    NotFound(String),

    /// A manifest operation was attempted on a non-manifest descriptor
    #[error("expected media type {expected} but got {actual}")]
    WrongMediaType { expected: String, actual: String },

    /// Downloaded or stored bytes do not hash to the expected digest
    #[error("content does not match digest {digest}")]
    DigestMismatch { digest: String },

    /// Blob length differs from its descriptor size
    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    /// Remote stream does not support range reads
    #[error("remote does not support range requests for {digest}")]
    NotSeekable { digest: String },

    /// A tar entry ended before its declared size was read
    #[error("truncated entry: {path}")]
    Truncated { path: PathBuf },

    /// A target path already exists and may not be overwritten
    #[error("path '{path}' already exists")]
    Conflict { path: PathBuf },

    /// A tar entry resolves outside the extraction directory
    #[error("illegal file path: {path}")]
    PathTraversal { path: PathBuf },

    /// A tar entry of a type the unpacker does not handle
    #[error("unrecognized type in archive: {name}")]
    UnsupportedEntry { name: String },

    /// An unpack filter string failed to parse
    #[error("invalid filter: {0}")]
    BadFilter(String),

    /// A parent ModelKit chain revisits an ancestor
    #[error("found cycle in modelkit references: {0}")]
    ReferenceCycle(String),

    /// A parent ModelKit chain exceeds the configured depth
    #[error("reached maximum number of model references: {0}")]
    ReferenceChainTooLong(String),

    /// A Kitfile entry's recorded digest disagrees with the manifest layer
    #[error("digest in config and manifest do not match in {base_type}")]
    ManifestConfigMismatch { base_type: String },

    /// The ambient cancellation token was triggered
    #[error("operation cancelled")]
    Cancelled,

    /// Network-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry authentication failure
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A model reference string failed to parse
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A digest string failed to parse
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Manifest, index, or Kitfile (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KitError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            KitError::BadFilter(_)
            | KitError::InvalidReference(_)
            | KitError::InvalidDigest(_) => 2,
            KitError::NotFound(_) => 3,
            KitError::DigestMismatch { .. }
            | KitError::SizeMismatch { .. }
            | KitError::Truncated { .. } => 4,
            KitError::Cancelled => 5,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for KitError {
    fn from(err: serde_json::Error) -> Self {
        KitError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KitError {
    fn from(err: serde_yaml::Error) -> Self {
        KitError::Serialization(err.to_string())
    }
}

/// Result type alias for ModelKit operations
pub type Result<T> = std::result::Result<T, KitError>;
