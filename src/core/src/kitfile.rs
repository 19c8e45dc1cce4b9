//! Kitfile: the ModelKit's human-authored YAML manifest.
//!
//! The Kitfile is serialized as the ModelKit's OCI config blob. Entry
//! order is significant: the i-th layer of a given base type in the
//! manifest corresponds to the i-th entry of that type here.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::oci::ContentDigest;

/// Default on-disk filename for a materialized Kitfile.
pub const DEFAULT_KITFILE_NAME: &str = "Kitfile";

/// Links a Kitfile entry to its manifest layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub digest: ContentDigest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<ContentDigest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ModelPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPart {
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub part_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default)]
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Docs {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_info: Option<LayerInfo>,
}

/// In-memory shape of a ModelKit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kitfile {
    pub manifest_version: String,
    #[serde(default)]
    pub package: Package,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<Code>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasets: Vec<Dataset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<Docs>,
}

impl Kitfile {
    /// Parse a Kitfile from YAML or JSON bytes (the config blob is stored
    /// as YAML; serde_yaml accepts both).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(data)?)
    }

    /// Serialize to the canonical YAML form used on disk and in the
    /// config blob.
    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
manifestVersion: "1.0"
package:
  name: demo-kit
  version: 0.1.0
  authors: ["ml-team"]
model:
  name: demo
  path: model/weights.bin
  framework: onnx
  layerInfo:
    digest: sha256:0000000000000000000000000000000000000000000000000000000000000001
code:
  - path: src/
datasets:
  - name: train
    path: data/train.csv
docs:
  - path: README.md
"#;

    #[test]
    fn test_parse_sample() {
        let kitfile = Kitfile::from_bytes(SAMPLE.as_bytes()).unwrap();
        assert_eq!(kitfile.manifest_version, "1.0");
        assert_eq!(kitfile.package.name.as_deref(), Some("demo-kit"));
        let model = kitfile.model.as_ref().unwrap();
        assert_eq!(model.path, "model/weights.bin");
        assert!(model.layer_info.is_some());
        assert_eq!(kitfile.code.len(), 1);
        assert_eq!(kitfile.datasets[0].name, "train");
        assert_eq!(kitfile.docs[0].path, "README.md");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let kitfile = Kitfile::from_bytes(SAMPLE.as_bytes()).unwrap();
        let yaml = kitfile.to_yaml().unwrap();
        let back = Kitfile::from_bytes(&yaml).unwrap();
        assert_eq!(back, kitfile);
    }

    #[test]
    fn test_empty_sections_omitted() {
        let kitfile = Kitfile {
            manifest_version: "1.0".to_string(),
            package: Package::default(),
            model: None,
            code: vec![],
            datasets: vec![],
            docs: vec![],
        };
        let yaml = String::from_utf8(kitfile.to_yaml().unwrap()).unwrap();
        assert!(!yaml.contains("code:"));
        assert!(!yaml.contains("model:"));
    }
}
