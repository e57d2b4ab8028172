//! Manifest document types and validation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};

use crate::error::{LifecycleError, Result};
use crate::hardware::HardwareTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
}

/// Content digest of one manifest file, written `algo:hex` (bare hex is blake3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl ContentHash {
    pub fn blake3(bytes: &[u8]) -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            hex: blake3::hash(bytes).to_hex().to_string(),
        }
    }

    pub fn sha256(bytes: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Self {
            algorithm: HashAlgorithm::Sha256,
            hex: format!("{:x}", Sha256::digest(bytes)),
        }
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let (algorithm, hex) = match value.split_once(':') {
            Some(("blake3", hex)) => (HashAlgorithm::Blake3, hex),
            Some(("sha256", hex)) => (HashAlgorithm::Sha256, hex),
            Some((other, _)) => return Err(format!("unsupported hash algorithm '{}'", other)),
            None => (HashAlgorithm::Blake3, value.as_str()),
        };
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("malformed digest '{}'", value));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algo = match self.algorithm {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        };
        write!(f, "{}:{}", algo, self.hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Path relative to the variant directory
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    /// Absolute download URL; defaults to `<variant uri>/<path>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Concrete, hardware-bound download unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVariant {
    pub id: String,
    pub alias: String,
    pub hardware: HardwareTier,
    #[serde(default)]
    pub execution_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub files: Vec<ManifestFile>,
}

impl ModelVariant {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn file_url(&self, file: &ManifestFile) -> Option<String> {
        if let Some(url) = &file.url {
            return Some(url.clone());
        }
        self.uri
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), file.path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub variants: Vec<ModelVariant>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| LifecycleError::catalog(format!("malformed manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for variant in &self.variants {
            if !ids.insert(variant.id.as_str()) {
                return Err(LifecycleError::catalog(format!(
                    "duplicate variant id '{}'",
                    variant.id
                )));
            }
            if variant.alias.is_empty() {
                return Err(LifecycleError::catalog(format!(
                    "variant '{}' has no alias",
                    variant.id
                )));
            }
            if variant.files.is_empty() {
                return Err(LifecycleError::catalog(format!(
                    "variant '{}' lists no files",
                    variant.id
                )));
            }
            for file in &variant.files {
                if !is_safe_relative(&file.path) {
                    return Err(LifecycleError::catalog(format!(
                        "variant '{}' has unsafe file path '{}'",
                        variant.id, file.path
                    )));
                }
                if variant.file_url(file).is_none() {
                    return Err(LifecycleError::catalog(format!(
                        "variant '{}' file '{}' has no download location",
                        variant.id, file.path
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> ManifestFile {
        ManifestFile {
            path: path.to_string(),
            hash: ContentHash::blake3(path.as_bytes()),
            size: 1,
            url: None,
        }
    }

    fn variant(id: &str, files: Vec<ManifestFile>) -> ModelVariant {
        ModelVariant {
            id: id.to_string(),
            alias: "phi-4-mini".to_string(),
            hardware: HardwareTier::Cpu,
            execution_provider: "CPUExecutionProvider".to_string(),
            uri: Some("http://models.local/phi".to_string()),
            files,
        }
    }

    #[test]
    fn test_hash_parsing() {
        let hex = "ab".repeat(32);
        let bare: ContentHash = hex.clone().try_into().unwrap();
        assert_eq!(bare.algorithm, HashAlgorithm::Blake3);
        let sha: ContentHash = format!("sha256:{}", hex.to_uppercase()).try_into().unwrap();
        assert_eq!(sha.algorithm, HashAlgorithm::Sha256);
        assert_eq!(sha.hex, hex);
        assert!(ContentHash::try_from("md5:abcd".to_string()).is_err());
        assert!(ContentHash::try_from("blake3:xyz".to_string()).is_err());
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(
            ContentHash::sha256(b"abc").hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ContentHash::blake3(b"abc").to_string().len(), "blake3:".len() + 64);
    }

    #[test]
    fn test_parse_camel_case_manifest() {
        let hash = ContentHash::blake3(b"weights").to_string();
        let json = format!(
            r#"{{"variants":[{{"id":"phi-4-mini/cpu","alias":"phi-4-mini","hardware":"cpu",
            "executionProvider":"CPUExecutionProvider","uri":"http://m/phi",
            "files":[{{"path":"model.onnx","hash":"{}","size":7}}]}}]}}"#,
            hash
        );
        let manifest = Manifest::parse(json.as_bytes()).unwrap();
        let v = &manifest.variants[0];
        assert_eq!(v.total_size(), 7);
        assert_eq!(v.file_url(&v.files[0]).unwrap(), "http://m/phi/model.onnx");
    }

    #[test]
    fn test_malformed_manifest_is_catalog_unavailable() {
        let err = Manifest::parse(b"{ not json").unwrap_err();
        assert_eq!(err.kind(), "CatalogUnavailable");
    }

    #[test]
    fn test_rejects_duplicate_ids_and_unsafe_paths() {
        let dup = Manifest {
            variants: vec![variant("a", vec![file("x")]), variant("a", vec![file("y")])],
        };
        assert!(dup.validate().is_err());

        let escape = Manifest {
            variants: vec![variant("a", vec![file("../etc/passwd")])],
        };
        assert!(escape.validate().is_err());

        let empty = Manifest {
            variants: vec![variant("a", vec![])],
        };
        assert!(empty.validate().is_err());

        let nested = Manifest {
            variants: vec![variant("a", vec![file("onnx/model.onnx")])],
        };
        assert!(nested.validate().is_ok());
    }
}
