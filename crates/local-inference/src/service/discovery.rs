//! Discovery file written by the service once it has bound its port.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl DiscoveryRecord {
    /// `None` when absent or not yet completely written.
    pub async fn read(path: &Path) -> Option<Self> {
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Discovery file {} not parseable yet: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }

    pub async fn remove(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove discovery file {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/service.json");
        let record = DiscoveryRecord {
            host: "127.0.0.1".into(),
            port: 50123,
            api_key: Some("k".into()),
            pid: Some(42),
        };
        record.write(&path).await.unwrap();
        assert_eq!(DiscoveryRecord::read(&path).await, Some(record));

        DiscoveryRecord::remove(&path).await;
        DiscoveryRecord::remove(&path).await;
        assert_eq!(DiscoveryRecord::read(&path).await, None);
    }

    #[tokio::test]
    async fn test_partial_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, "{\"host\":\"127.0").unwrap();
        assert_eq!(DiscoveryRecord::read(&path).await, None);
    }
}
