//! OCI descriptor and digest primitives.
//!
//! Every blob handled by the store is identified by a [`Descriptor`]:
//! a `(mediaType, digest, size)` triple. Digests are `algorithm:hex`
//! strings; only sha256 content is verified.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{KitError, Result};

/// Media type of an OCI image manifest.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type identifying a ModelKit config (Kitfile) blob.
pub const MEDIA_TYPE_MODELKIT_CONFIG: &str = "application/vnd.kitops.modelkit.config.v1+json";

const MODELKIT_LAYER_PREFIX: &str = "application/vnd.kitops.modelkit.";

/// A content digest in `algorithm:hex` form.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Parse and validate an `algorithm:hex` digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| KitError::InvalidDigest(format!("'{s}': expected algorithm:hex")))?;
        if alg.is_empty() || hex.is_empty() {
            return Err(KitError::InvalidDigest(format!(
                "'{s}': expected algorithm:hex"
            )));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KitError::InvalidDigest(format!(
                "'{s}': encoded portion is not hex"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn from_content(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("sha256:{:x}", hasher.finalize()))
    }

    /// The algorithm portion (e.g. "sha256").
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// The hex-encoded portion.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Streaming verifier for this digest. Fails for non-sha256 algorithms.
    pub fn verifier(&self) -> Result<DigestVerifier> {
        if self.algorithm() != "sha256" {
            return Err(KitError::InvalidDigest(format!(
                "unsupported digest algorithm '{}'",
                self.algorithm()
            )));
        }
        Ok(DigestVerifier {
            hasher: Sha256::new(),
            expected: self.clone(),
        })
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.0)
    }
}

/// Incrementally hashes a byte stream and attests it matches a digest.
pub struct DigestVerifier {
    hasher: Sha256,
    expected: ContentDigest,
}

impl DigestVerifier {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consume the verifier; error if the observed hash differs.
    pub fn verify(self) -> Result<()> {
        let actual = format!("sha256:{:x}", self.hasher.finalize());
        if actual != self.expected.as_str() {
            return Err(KitError::DigestMismatch {
                digest: self.expected.to_string(),
            });
        }
        Ok(())
    }
}

/// Canonical identifier for a blob: media type, digest, and size.
///
/// Two descriptors identify the same content iff their digests are equal.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: ContentDigest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: ContentDigest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: None,
        }
    }

    /// Descriptor for a manifest blob given its raw bytes.
    pub fn for_manifest_bytes(data: &[u8]) -> Self {
        Self::new(
            MEDIA_TYPE_IMAGE_MANIFEST,
            ContentDigest::from_content(data),
            data.len() as u64,
        )
    }

    pub fn is_manifest(&self) -> bool {
        self.media_type == MEDIA_TYPE_IMAGE_MANIFEST
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Descriptor {}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("media_type", &self.media_type)
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish()
    }
}

/// Base type of a ModelKit layer or config blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Config,
    Model,
    ModelPart,
    Dataset,
    Code,
    Docs,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::Config => "config",
            BaseType::Model => "model",
            BaseType::ModelPart => "modelpart",
            BaseType::Dataset => "dataset",
            BaseType::Code => "code",
            BaseType::Docs => "docs",
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compression applied to a layer tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerCompression {
    #[default]
    None,
    Gzip,
    /// Gzip at fastest level; indistinguishable from `Gzip` on the wire.
    GzipFastest,
}

impl LayerCompression {
    pub fn is_gzip(&self) -> bool {
        matches!(self, LayerCompression::Gzip | LayerCompression::GzipFastest)
    }
}

/// A parsed ModelKit media type: base type plus compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelKitMediaType {
    pub base: BaseType,
    pub compression: LayerCompression,
}

impl ModelKitMediaType {
    /// Parse a ModelKit media type string.
    ///
    /// The config media type is `application/vnd.kitops.modelkit.config.v1+json`;
    /// layers follow `application/vnd.kitops.modelkit.<base>.v1.tar[+gzip]`.
    pub fn parse(media_type: &str) -> Result<Self> {
        if media_type == MEDIA_TYPE_MODELKIT_CONFIG {
            return Ok(Self {
                base: BaseType::Config,
                compression: LayerCompression::None,
            });
        }
        let rest = media_type.strip_prefix(MODELKIT_LAYER_PREFIX).ok_or_else(|| {
            KitError::WrongMediaType {
                expected: format!("{MODELKIT_LAYER_PREFIX}*"),
                actual: media_type.to_string(),
            }
        })?;
        let (base_str, suffix) =
            rest.split_once(".v1.tar")
                .ok_or_else(|| KitError::WrongMediaType {
                    expected: format!("{MODELKIT_LAYER_PREFIX}<base>.v1.tar[+gzip]"),
                    actual: media_type.to_string(),
                })?;
        let base = match base_str {
            "model" => BaseType::Model,
            "modelpart" => BaseType::ModelPart,
            "dataset" => BaseType::Dataset,
            "code" => BaseType::Code,
            "docs" => BaseType::Docs,
            _ => {
                return Err(KitError::WrongMediaType {
                    expected: "a modelkit layer base type".to_string(),
                    actual: media_type.to_string(),
                })
            }
        };
        let compression = match suffix {
            "" => LayerCompression::None,
            "+gzip" => LayerCompression::Gzip,
            _ => {
                return Err(KitError::WrongMediaType {
                    expected: "tar or tar+gzip".to_string(),
                    actual: media_type.to_string(),
                })
            }
        };
        Ok(Self { base, compression })
    }

    /// Format as a wire media type string.
    pub fn to_media_type(&self) -> String {
        if self.base == BaseType::Config {
            return MEDIA_TYPE_MODELKIT_CONFIG.to_string();
        }
        let suffix = if self.compression.is_gzip() { "+gzip" } else { "" };
        format!("{MODELKIT_LAYER_PREFIX}{}.v1.tar{suffix}", self.base)
    }
}
