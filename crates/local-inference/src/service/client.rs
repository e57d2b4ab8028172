//! HTTP client for the service's model-management endpoints.
//!
//! Inference routes (`/v1/chat/completions`, ...) are not wrapped here; callers
//! talk to them directly using the endpoint and api key.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::ServiceEndpoint;
use crate::error::{LifecycleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceModelStatus {
    Loading,
    Ready,
    Failed,
    Unloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceModelState {
    pub variant_id: String,
    pub status: ServiceModelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub models: Vec<ServiceModelState>,
}

impl ServiceStatus {
    pub fn model(&self, variant_id: &str) -> Option<&ServiceModelState> {
        self.models.iter().find(|m| m.variant_id == variant_id)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadRequest<'a> {
    variant_id: &'a str,
    path: &'a Path,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnloadRequest<'a> {
    variant_id: &'a str,
}

#[derive(Clone)]
pub struct HttpServiceClient {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpServiceClient {
    pub fn new(endpoint: &ServiceEndpoint) -> Self {
        Self::with_timeout(endpoint, Duration::from_secs(600))
    }

    pub fn with_timeout(endpoint: &ServiceEndpoint, timeout: Duration) -> Self {
        Self {
            base_url: endpoint.base_url(),
            api_key: endpoint.api_key.clone(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| LifecycleError::ServiceRequest {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        let url = self.url("/status");
        let resp = self.send(&url, self.http_client.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(LifecycleError::ServiceRequest {
                reason: format!("status returned {}", resp.status()),
                url,
            });
        }
        resp.json().await.map_err(|e| LifecycleError::ServiceRequest {
            url,
            reason: format!("malformed status response: {}", e),
        })
    }

    /// Any 2xx answer counts as a live, compatible service.
    pub async fn probe(&self) -> bool {
        let url = self.url("/status");
        match self.authorize(self.http_client.get(&url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                false
            }
        }
    }

    pub async fn load(&self, variant_id: &str, path: &Path) -> Result<ServiceModelState> {
        let url = self.url("/load");
        let body = LoadRequest { variant_id, path };
        let resp = self.send(&url, self.http_client.post(&url).json(&body)).await?;
        let resp = reject_unless_success(resp, "load", variant_id).await?;
        resp.json().await.map_err(|e| LifecycleError::ServiceRequest {
            url,
            reason: format!("malformed load response: {}", e),
        })
    }

    /// A 404 means the service does not hold the variant, which is what
    /// unloading asks for.
    pub async fn unload(&self, variant_id: &str) -> Result<()> {
        let url = self.url("/unload");
        let body = UnloadRequest { variant_id };
        let resp = self.send(&url, self.http_client.post(&url).json(&body)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!("Service reports {} already unloaded", variant_id);
            return Ok(());
        }
        reject_unless_success(resp, "unload", variant_id).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let url = self.url("/shutdown");
        self.send(&url, self.http_client.post(&url)).await?;
        Ok(())
    }
}

async fn reject_unless_success(
    resp: reqwest::Response,
    operation: &'static str,
    variant_id: &str,
) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(LifecycleError::LoadRejected {
        operation,
        variant_id: variant_id.to_string(),
        status,
        body,
    })
}
