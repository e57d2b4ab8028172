//! On-disk cache of variant weight files.
//!
//! Layout: `<root>/<variant dir>/<relative paths>` with downloads staged in a
//! `.staging-<variant dir>` sibling that is renamed into place only after every
//! file has been hashed against the manifest. A staging directory is removed
//! whenever its download does not complete, including when the download future
//! is dropped.

pub mod download;
pub mod progress;

pub use progress::{progress_channel, DownloadProgress, ProgressReporter, ProgressUpdate};

use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::{ContentHash, HashAlgorithm, ModelVariant};
use crate::error::{LifecycleError, Result};
use download::ByteCounter;

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub variant_id: String,
    pub path: PathBuf,
    pub verified: bool,
}

pub struct CacheStore {
    root: PathBuf,
    http_client: reqwest::Client,
}

impl CacheStore {
    /// Open (creating if needed) the cache at `root` and sweep staging
    /// directories left behind by a crashed process.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| LifecycleError::io(&root, e))?;

        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| LifecycleError::io(&root, e))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!("Removing abandoned staging directory {}", entry.path().display());
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
            }
        }

        Ok(Self {
            root,
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn variant_path(&self, variant_id: &str) -> PathBuf {
        self.root.join(dir_name(variant_id))
    }

    fn staging_path(&self, variant_id: &str) -> PathBuf {
        self.root
            .join(format!("{}{}", STAGING_PREFIX, dir_name(variant_id)))
    }

    /// Cheap existence check for pre-flight hints. Does not hash; may be stale.
    pub fn is_cached(&self, variant_id: &str) -> bool {
        self.variant_path(variant_id).is_dir()
    }

    /// Existing entry whose files all hash to the manifest values. A present
    /// but corrupt entry is evicted.
    pub async fn lookup(&self, variant: &ModelVariant) -> Result<Option<CacheEntry>> {
        let path = self.variant_path(&variant.id);
        if !path.is_dir() {
            return Ok(None);
        }

        for file in &variant.files {
            let file_path = path.join(&file.path);
            if !file_path.is_file() {
                warn!("Cached {} is missing {}, evicting", variant.id, file.path);
                self.evict(&variant.id).await?;
                return Ok(None);
            }
            let (actual, _) = hash_file(file_path, file.hash.algorithm).await?;
            if actual != file.hash {
                warn!(
                    "Cached {} file {} no longer matches manifest, evicting",
                    variant.id, file.path
                );
                self.evict(&variant.id).await?;
                return Ok(None);
            }
        }

        Ok(Some(CacheEntry {
            variant_id: variant.id.clone(),
            path,
            verified: true,
        }))
    }

    pub async fn ensure_downloaded(
        &self,
        variant: &ModelVariant,
        reporter: Option<ProgressReporter>,
    ) -> Result<CacheEntry> {
        let total = variant.total_size();

        if let Some(entry) = self.lookup(variant).await? {
            debug!("Cache hit for {}", variant.id);
            if let Some(r) = reporter {
                r.finish(total);
            }
            return Ok(entry);
        }

        info!(
            "Downloading {} ({} files, {} bytes)",
            variant.id,
            variant.files.len(),
            total
        );
        let staging = StagingDir::create(self.staging_path(&variant.id)).await?;

        let mut counter = ByteCounter {
            done: 0,
            total,
            reporter: reporter.as_ref(),
        };
        for file in &variant.files {
            let url = variant
                .file_url(file)
                .ok_or_else(|| LifecycleError::download(&variant.id, format!("no URL for {}", file.path)))?;
            let dest = staging.path().join(&file.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| LifecycleError::io(parent, e))?;
            }

            download::fetch_file(&self.http_client, &variant.id, &url, &dest, &mut counter).await?;

            let (actual, bytes) = hash_file(dest, file.hash.algorithm).await?;
            if actual != file.hash {
                staging.discard().await;
                return Err(LifecycleError::IntegrityError {
                    variant_id: variant.id.clone(),
                    file: file.path.clone(),
                    expected: file.hash.to_string(),
                    actual: actual.to_string(),
                    bytes,
                });
            }
        }

        let final_path = self.variant_path(&variant.id);
        if final_path.exists() {
            tokio::fs::remove_dir_all(&final_path)
                .await
                .map_err(|e| LifecycleError::io(&final_path, e))?;
        }
        staging.publish(&final_path).await?;
        info!("Cached {} at {}", variant.id, final_path.display());

        if let Some(r) = reporter {
            r.finish(total);
        }
        Ok(CacheEntry {
            variant_id: variant.id.clone(),
            path: final_path,
            verified: true,
        })
    }

    /// Remove a variant's files. Absent entries are not an error.
    pub async fn evict(&self, variant_id: &str) -> Result<()> {
        for path in [self.variant_path(variant_id), self.staging_path(variant_id)] {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => info!("Evicted {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(LifecycleError::io(&path, e)),
            }
        }
        Ok(())
    }
}

/// Directory name for a variant id. Path separators become `--`.
pub fn dir_name(variant_id: &str) -> String {
    let name: String = variant_id
        .replace(['/', '\\'], "--")
        .chars()
        .map(|c| if c == ':' { '_' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("_{}", name),
        _ => name,
    }
}

/// Staging directory removed on drop unless published.
struct StagingDir {
    path: Option<PathBuf>,
}

impl StagingDir {
    async fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| LifecycleError::io(&path, e))?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| LifecycleError::io(&path, e))?;
        Ok(Self { path: Some(path) })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    async fn publish(mut self, target: &Path) -> Result<()> {
        if let Some(path) = self.path.take() {
            if let Err(e) = tokio::fs::rename(&path, target).await {
                self.path = Some(path);
                return Err(LifecycleError::io(target, e));
            }
        }
        Ok(())
    }

    async fn discard(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!("Failed to remove staging {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            debug!("Discarding staging {}", path.display());
            let _ = std::fs::remove_dir_all(&path);
        }
    }
}

/// Hash a file off the async executor. Returns the digest and bytes read.
async fn hash_file(path: PathBuf, algorithm: HashAlgorithm) -> Result<(ContentHash, u64)> {
    let display = path.clone();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path, algorithm))
        .await
        .map_err(|e| LifecycleError::io(&display, std::io::Error::other(e)))?
        .map_err(|e| LifecycleError::io(&display, e))
}

fn hash_file_blocking(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<(ContentHash, u64)> {
    use sha2::{Digest, Sha256};

    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut bytes = 0u64;
    let mut blake = blake3::Hasher::new();
    let mut sha = Sha256::new();

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        match algorithm {
            HashAlgorithm::Blake3 => {
                blake.update(&buf[..n]);
            }
            HashAlgorithm::Sha256 => sha.update(&buf[..n]),
        }
    }

    let hex = match algorithm {
        HashAlgorithm::Blake3 => blake.finalize().to_hex().to_string(),
        HashAlgorithm::Sha256 => format!("{:x}", sha.finalize()),
    };
    Ok((ContentHash { algorithm, hex }, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ManifestFile;
    use crate::hardware::HardwareTier;
    use futures_util::StreamExt;

    fn variant(server_url: &str, files: &[(&str, &str)]) -> ModelVariant {
        ModelVariant {
            id: "phi-4-mini/cpu".to_string(),
            alias: "phi-4-mini".to_string(),
            hardware: HardwareTier::Cpu,
            execution_provider: "CPUExecutionProvider".to_string(),
            uri: Some(format!("{}/phi", server_url)),
            files: files
                .iter()
                .map(|(path, body)| ManifestFile {
                    path: path.to_string(),
                    hash: ContentHash::blake3(body.as_bytes()),
                    size: body.len() as u64,
                    url: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_dir_name_flattens_separators() {
        assert_eq!(dir_name("phi-4-mini/cuda"), "phi-4-mini--cuda");
        assert_eq!(dir_name("hf:org/model"), "hf_org--model");
        assert_eq!(dir_name(".."), "_..");
    }

    #[tokio::test]
    async fn test_download_then_cache_hit_without_network() {
        let mut server = mockito::Server::new_async().await;
        let config = server
            .mock("GET", "/phi/config.json")
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;
        let weights = server
            .mock("GET", "/phi/onnx/model.onnx")
            .with_body("7".repeat(4096))
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let weights_body = "7".repeat(4096);
        let v = variant(
            &server.url(),
            &[("config.json", "{}"), ("onnx/model.onnx", weights_body.as_str())],
        );

        let (reporter, progress) = progress_channel();
        let entry = store.ensure_downloaded(&v, Some(reporter)).await.unwrap();
        assert!(entry.verified);
        assert!(entry.path.join("onnx/model.onnx").is_file());
        let last = progress.collect::<Vec<_>>().await.last().copied().unwrap();
        assert_eq!(last.bytes_downloaded, v.total_size());

        let again = store.ensure_downloaded(&v, None).await.unwrap();
        assert_eq!(again, entry);
        config.assert_async().await;
        weights.assert_async().await;
        assert!(store.is_cached(&v.id));
    }

    #[tokio::test]
    async fn test_hash_mismatch_discards_staging_and_retry_succeeds() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/phi/a.bin").with_body("aaaa").create_async().await;
        let corrupt = server
            .mock("GET", "/phi/b.bin")
            .with_body("corrupted")
            .create_async()
            .await;
        server.mock("GET", "/phi/c.bin").with_body("cccc").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let v = variant(
            &server.url(),
            &[("a.bin", "aaaa"), ("b.bin", "bbbb"), ("c.bin", "cccc")],
        );

        let err = store.ensure_downloaded(&v, None).await.unwrap_err();
        match &err {
            LifecycleError::IntegrityError { file, bytes, .. } => {
                assert_eq!(file, "b.bin");
                assert_eq!(*bytes, 9);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!store.is_cached(&v.id));
        assert!(!store.staging_path(&v.id).exists());
        assert!(store.lookup(&v).await.unwrap().is_none());

        corrupt.remove_async().await;
        server.mock("GET", "/phi/b.bin").with_body("bbbb").create_async().await;
        let entry = store.ensure_downloaded(&v, None).await.unwrap();
        assert!(entry.verified);
    }

    #[tokio::test]
    async fn test_http_error_is_download_failed_with_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/phi/a.bin")
            .with_status(404)
            .with_body("missing")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let v = variant(&server.url(), &[("a.bin", "aaaa")]);

        match store.ensure_downloaded(&v, None).await.unwrap_err() {
            LifecycleError::DownloadFailed { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!store.staging_path(&v.id).exists());
    }

    #[tokio::test]
    async fn test_dropped_download_leaves_nothing_behind() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/phi/a.bin").with_body("aaaa").create_async().await;
        // Slow second file so the future is dropped mid-download.
        server
            .mock("GET", "/phi/b.bin")
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_secs(2));
                w.write_all(b"bbbb")
            })
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let v = variant(&server.url(), &[("a.bin", "aaaa"), ("b.bin", "bbbb")]);

        let result =
            tokio::time::timeout(Duration::from_millis(300), store.ensure_downloaded(&v, None)).await;
        assert!(result.is_err());
        assert!(!store.is_cached(&v.id));
        assert!(!store.staging_path(&v.id).exists());
    }

    #[tokio::test]
    async fn test_corrupted_cache_is_evicted_on_lookup() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/phi/a.bin").with_body("aaaa").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let v = variant(&server.url(), &[("a.bin", "aaaa")]);
        let entry = store.ensure_downloaded(&v, None).await.unwrap();

        // Same size, different bytes: size/mtime checks alone would miss this.
        std::fs::write(entry.path.join("a.bin"), b"aaab").unwrap();
        assert!(store.lookup(&v).await.unwrap().is_none());
        assert!(!store.is_cached(&v.id));
    }

    #[tokio::test]
    async fn test_evict_is_idempotent_and_open_sweeps_staging() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".staging-old--variant")).unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        assert!(!dir.path().join(".staging-old--variant").exists());

        store.evict("never/downloaded").await.unwrap();
        store.evict("never/downloaded").await.unwrap();
    }

    #[tokio::test]
    async fn test_sha256_manifest_entries_verify() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/phi/a.bin").with_body("abc").create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let mut v = variant(&server.url(), &[("a.bin", "abc")]);
        v.files[0].hash = ContentHash::sha256(b"abc");
        assert!(store.ensure_downloaded(&v, None).await.unwrap().verified);
    }
}
