//! Catalog of model aliases and their hardware-specific variants.
//!
//! The last successfully fetched manifest is held lock-free in memory and
//! mirrored to disk, so an unreachable source degrades to a stale snapshot
//! instead of failing.

pub mod manifest;
pub mod source;

pub use manifest::{ContentHash, HashAlgorithm, Manifest, ManifestFile, ModelVariant};
pub use source::{BundledManifest, ManifestSource, RemoteManifest};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{LifecycleError, Result};

/// Point-in-time view of the catalog.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    manifest: Arc<Manifest>,
    pub fetched_at: DateTime<Utc>,
    /// True when the source was unreachable and an older manifest was served
    pub stale: bool,
}

impl CatalogSnapshot {
    pub fn variants(&self) -> &[ModelVariant] {
        &self.manifest.variants
    }

    /// Variants published under `alias`, in publication order.
    pub fn find_variants(&self, alias: &str) -> Vec<&ModelVariant> {
        self.manifest
            .variants
            .iter()
            .filter(|v| v.alias == alias)
            .collect()
    }

    pub fn find_variant(&self, variant_id: &str) -> Option<&ModelVariant> {
        self.manifest.variants.iter().find(|v| v.id == variant_id)
    }

    /// Distinct aliases in first-publication order.
    pub fn aliases(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for v in &self.manifest.variants {
            if !seen.contains(&v.alias.as_str()) {
                seen.push(v.alias.as_str());
            }
        }
        seen
    }
}

struct Fetched {
    manifest: Arc<Manifest>,
    fetched_at: DateTime<Utc>,
    /// Set once the sources failed and this copy is being served as a fallback
    stale: bool,
}

impl Fetched {
    fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            manifest: self.manifest.clone(),
            fetched_at: self.fetched_at,
            stale: self.stale,
        }
    }
}

pub struct Catalog {
    sources: Vec<Box<dyn ManifestSource>>,
    snapshot_path: Option<PathBuf>,
    last_good: ArcSwapOption<Fetched>,
}

impl Catalog {
    /// `sources` are tried in order; `snapshot_path` mirrors the last good manifest.
    pub fn new(sources: Vec<Box<dyn ManifestSource>>, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            sources,
            snapshot_path,
            last_good: ArcSwapOption::empty(),
        }
    }

    /// Current snapshot without any I/O. Stays flagged stale until a source
    /// answers again.
    pub fn current(&self) -> Option<CatalogSnapshot> {
        self.last_good.load_full().map(|f| f.snapshot())
    }

    pub async fn refresh(&self) -> Result<CatalogSnapshot> {
        let mut failures = Vec::new();

        for source in &self.sources {
            match source.fetch().await {
                Ok(manifest) => {
                    info!(
                        "Catalog refreshed from {} ({} variants)",
                        source.describe(),
                        manifest.variants.len()
                    );
                    let fetched = Arc::new(Fetched {
                        manifest: Arc::new(manifest),
                        fetched_at: Utc::now(),
                        stale: false,
                    });
                    self.persist(&fetched.manifest).await;
                    self.last_good.store(Some(fetched.clone()));
                    return Ok(fetched.snapshot());
                }
                Err(e) => {
                    warn!("Catalog source {} failed: {}", source.describe(), e);
                    failures.push(e.to_string());
                }
            }
        }

        if let Some(fetched) = self.last_good.load_full() {
            warn!("Serving stale catalog from {}", fetched.fetched_at);
            let fallback = Arc::new(Fetched {
                manifest: fetched.manifest.clone(),
                fetched_at: fetched.fetched_at,
                stale: true,
            });
            self.last_good.store(Some(fallback.clone()));
            return Ok(fallback.snapshot());
        }

        if let Some(snapshot) = self.load_persisted().await {
            warn!("Serving stale catalog from disk snapshot");
            self.last_good.store(Some(Arc::new(Fetched {
                manifest: snapshot.manifest.clone(),
                fetched_at: snapshot.fetched_at,
                stale: true,
            })));
            return Ok(snapshot);
        }

        if failures.is_empty() {
            failures.push("no manifest source configured".to_string());
        }
        Err(LifecycleError::catalog(failures.join("; ")))
    }

    async fn persist(&self, manifest: &Manifest) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to persist catalog snapshot to {}: {}", path.display(), e);
        }
    }

    async fn load_persisted(&self) -> Option<CatalogSnapshot> {
        let path = self.snapshot_path.as_ref()?;
        let bytes = tokio::fs::read(path).await.ok()?;
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        match Manifest::parse(&bytes) {
            Ok(manifest) => Some(CatalogSnapshot {
                manifest: Arc::new(manifest),
                fetched_at: modified,
                stale: true,
            }),
            Err(e) => {
                warn!("Ignoring corrupt catalog snapshot {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareTier;

    fn manifest_json(ids: &[(&str, &str, &str)]) -> String {
        let variants: Vec<ModelVariant> = ids
            .iter()
            .map(|(id, alias, hw)| ModelVariant {
                id: id.to_string(),
                alias: alias.to_string(),
                hardware: hw.parse::<HardwareTier>().unwrap(),
                execution_provider: String::new(),
                uri: Some("http://models.local".to_string()),
                files: vec![ManifestFile {
                    path: "model.onnx".to_string(),
                    hash: ContentHash::blake3(id.as_bytes()),
                    size: 4,
                    url: None,
                }],
            })
            .collect();
        serde_json::to_string(&Manifest { variants }).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_groups_by_alias_in_publication_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            manifest_json(&[
                ("phi-4-mini/cpu", "phi-4-mini", "cpu"),
                ("qwen/cpu", "qwen", "cpu"),
                ("phi-4-mini/cuda", "phi-4-mini", "cuda"),
            ]),
        )
        .unwrap();

        let catalog = Catalog::new(vec![Box::new(BundledManifest::new(&path))], None);
        assert!(catalog.current().is_none());

        let snapshot = catalog.refresh().await.unwrap();
        assert!(!snapshot.stale);
        let ids: Vec<&str> = snapshot
            .find_variants("phi-4-mini")
            .iter()
            .map(|v| v.id.as_str())
            .collect();
        assert_eq!(ids, vec!["phi-4-mini/cpu", "phi-4-mini/cuda"]);
        assert_eq!(snapshot.aliases(), vec!["phi-4-mini", "qwen"]);
        assert!(snapshot.find_variant("qwen/cpu").is_some());
        assert!(catalog.current().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_source_without_cache_fails() {
        let catalog = Catalog::new(
            vec![Box::new(BundledManifest::new("/nonexistent/manifest.json"))],
            None,
        );
        let err = catalog.refresh().await.unwrap_err();
        assert_eq!(err.kind(), "CatalogUnavailable");
    }

    #[tokio::test]
    async fn test_falls_back_to_last_good_and_flags_stale() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/catalog.json")
            .with_status(200)
            .with_body(manifest_json(&[("phi/cpu", "phi", "cpu")]))
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("catalog.json");
        let url = format!("{}/catalog.json", server.url());
        let catalog = Catalog::new(
            vec![Box::new(RemoteManifest::new(url.clone()))],
            Some(snapshot_path.clone()),
        );

        assert!(!catalog.refresh().await.unwrap().stale);
        assert!(!catalog.current().unwrap().stale);
        mock.assert_async().await;
        mock.remove_async().await;

        let stale = catalog.refresh().await.unwrap();
        assert!(stale.stale);
        assert!(stale.find_variant("phi/cpu").is_some());
        assert!(catalog.current().unwrap().stale);

        // A fresh process only has the disk mirror.
        let cold = Catalog::new(vec![Box::new(RemoteManifest::new(url))], Some(snapshot_path));
        let from_disk = cold.refresh().await.unwrap();
        assert!(from_disk.stale);
        assert_eq!(from_disk.variants().len(), 1);
        assert!(cold.current().unwrap().stale);
    }

    #[tokio::test]
    async fn test_malformed_remote_document_falls_through_to_next_source() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/catalog.json")
            .with_status(200)
            .with_body("{\"variants\": 3}")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("bundled.json");
        std::fs::write(&bundled, manifest_json(&[("phi/cpu", "phi", "cpu")])).unwrap();

        let catalog = Catalog::new(
            vec![
                Box::new(RemoteManifest::new(format!("{}/catalog.json", server.url()))),
                Box::new(BundledManifest::new(&bundled)),
            ],
            None,
        );
        let snapshot = catalog.refresh().await.unwrap();
        assert!(!snapshot.stale);
        assert_eq!(snapshot.variants()[0].id, "phi/cpu");
    }
}
