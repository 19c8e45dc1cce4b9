//! ModelKit reference parsing.
//!
//! References take the form `registry/repository[:tag|@digest]`, e.g.
//! `registry.example.com/org/model:1.0`. A reference with no registry
//! component is resolved against the local default.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KitError, Result};
use crate::oci::ContentDigest;

/// Registry assumed when a reference omits one.
pub const DEFAULT_REGISTRY: &str = "localhost";

/// Tag assumed when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed ModelKit reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReference {
    /// Registry hostname, possibly with port (e.g. "registry.example.com:5000")
    pub registry: String,
    /// Repository path (e.g. "org/model")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<ContentDigest>,
}

impl ModelReference {
    /// Parse a reference string.
    ///
    /// Supported forms:
    /// - `model` → localhost/model:latest
    /// - `org/model:v1` → localhost/org/model:v1
    /// - `registry.example.com/org/model:v1`
    /// - `registry.example.com/org/model@sha256:...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KitError::InvalidReference("empty reference".to_string()));
        }

        // Split off the digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest_part)) => {
                let digest = ContentDigest::parse(digest_part).map_err(|_| {
                    KitError::InvalidReference(format!(
                        "'{reference}': digest must be algorithm:hex"
                    ))
                })?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // Split the tag: the last colon after the last slash
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash) => match name_tag[slash + 1..].rfind(':') {
                Some(colon) => {
                    let colon = slash + 1 + colon;
                    (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rfind(':') {
                // A colon with no slash could be registry:port; only treat
                // a non-numeric suffix as a tag.
                Some(colon) if !name_tag[colon + 1..].chars().all(|c| c.is_ascii_digit()) => {
                    (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
                }
                _ => (name_tag, None),
            },
        };

        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(KitError::InvalidReference(format!(
                    "'{reference}': empty tag"
                )));
            }
        }

        let (registry, repository) = split_registry_repository(name)?;

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ModelReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The `registry/repository` name used to key local repository state.
    pub fn repo_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Tag or digest portion used to resolve within a repository.
    pub fn reference(&self) -> String {
        if let Some(digest) = &self.digest {
            digest.to_string()
        } else if let Some(tag) = &self.tag {
            tag.clone()
        } else {
            DEFAULT_TAG.to_string()
        }
    }

    /// Whether the reference part names content by digest.
    pub fn is_digest_reference(&self) -> bool {
        self.digest.is_some()
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some(slash) = name.find('/') {
        let first = &name[..slash];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash + 1..];
            if repo.is_empty() {
                return Err(KitError::InvalidReference(format!(
                    "'{name}': empty repository"
                )));
            }
            return Ok((first.to_string(), repo.to_string()));
        }
    }
    if name.is_empty() {
        return Err(KitError::InvalidReference("empty repository".to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), name.to_string()))
}

/// Whether a Kitfile model path names a parent ModelKit rather than a file.
///
/// A path is treated as a reference when it parses and either carries an
/// explicit tag or digest after a `/`, or its first segment looks like a
/// registry host. Plain relative file paths never qualify.
pub fn is_model_reference(path: &str) -> bool {
    let Some(slash) = path.find('/') else {
        return false;
    };
    let first = &path[..slash];
    let host_like = first.contains('.') || first.contains(':') || first == "localhost";
    let tagged = path[slash..].contains(':') || path.contains('@');
    if !host_like && !tagged {
        return false;
    }
    ModelReference::parse(path).is_ok()
}
