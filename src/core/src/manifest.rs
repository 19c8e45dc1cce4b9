//! OCI image-manifest wire format.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::oci::{Descriptor, ModelKitMediaType, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_MODELKIT_CONFIG};

/// An OCI image manifest: a config descriptor plus an ordered layer list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Parse manifest JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether this manifest describes a ModelKit.
    ///
    /// True iff the config media type is the ModelKit config type and every
    /// layer media type parses to a non-config base.
    pub fn is_modelkit(&self) -> bool {
        if self.config.media_type != MEDIA_TYPE_MODELKIT_CONFIG {
            return false;
        }
        self.layers.iter().all(|layer| {
            ModelKitMediaType::parse(&layer.media_type)
                .map(|mt| mt.base != crate::oci::BaseType::Config)
                .unwrap_or(false)
        })
    }

    /// Manifest self-descriptor computed from its serialized bytes.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let bytes = self.to_bytes()?;
        Ok(Descriptor::for_manifest_bytes(&bytes))
    }

    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            config,
            layers,
        }
    }
}
