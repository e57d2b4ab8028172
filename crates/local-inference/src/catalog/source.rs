//! Manifest sources: a remote HTTP document or a file bundled with the install.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::manifest::Manifest;
use crate::error::{LifecycleError, Result};

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Human readable location, used in logs and errors
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Manifest>;
}

pub struct RemoteManifest {
    url: String,
    http_client: reqwest::Client,
}

impl RemoteManifest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ManifestSource for RemoteManifest {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Manifest> {
        debug!("Fetching catalog manifest from {}", self.url);
        let resp = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| LifecycleError::catalog(format!("{} unreachable: {}", self.url, e)))?;

        if !resp.status().is_success() {
            return Err(LifecycleError::catalog(format!(
                "{} returned {}",
                self.url,
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| LifecycleError::catalog(format!("{} read failed: {}", self.url, e)))?;
        Manifest::parse(&body)
    }
}

pub struct BundledManifest {
    path: PathBuf,
}

impl BundledManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ManifestSource for BundledManifest {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Manifest> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            LifecycleError::catalog(format!("{} unreadable: {}", self.path.display(), e))
        })?;
        Manifest::parse(&bytes)
    }
}
