//! Service endpoint locator.
//!
//! Finds a running inference service through its discovery file or a probe of
//! well-known ports, or launches one and waits for it to publish the port it
//! bound. Only a service this locator launched is ever stopped by it.

pub mod client;
pub mod discovery;

pub use client::{HttpServiceClient, ServiceModelState, ServiceModelStatus, ServiceStatus};
pub use discovery::DiscoveryRecord;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};

pub const DISCOVERY_ENV: &str = "LOCAL_INFERENCE_DISCOVERY_FILE";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a running service can be reached. Read the port from here every time;
/// it is assigned per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub pid: Option<u32>,
    /// True when this process launched the service
    pub owned: bool,
}

impl ServiceEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub binary: Option<PathBuf>,
    pub args: Vec<String>,
    pub host: String,
    pub discovery_file: PathBuf,
    pub probe_ports: Vec<u16>,
    pub api_key: Option<String>,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
            discovery_file: std::env::temp_dir().join("local-inference").join("service.json"),
            probe_ports: Vec::new(),
            api_key: None,
            startup_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
        }
    }
}

pub struct ServiceLocator {
    config: ServiceConfig,
    endpoint: ArcSwapOption<ServiceEndpoint>,
    child: Mutex<Option<Child>>,
}

impl ServiceLocator {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            endpoint: ArcSwapOption::empty(),
            child: Mutex::new(None),
        }
    }

    /// Current endpoint without any I/O.
    pub fn endpoint(&self) -> Option<ServiceEndpoint> {
        self.endpoint.load_full().map(|e| (*e).clone())
    }

    pub async fn ensure_running(&self) -> Result<ServiceEndpoint> {
        if let Some(current) = self.endpoint.load_full() {
            if probe(&current).await {
                return Ok((*current).clone());
            }
            warn!("Service at {} stopped answering, locating again", current.base_url());
            self.endpoint.store(None);
            if current.owned {
                self.retire_child().await;
            }
        }

        let endpoint = match self.discover().await {
            Some(found) => found,
            None => self.launch().await?,
        };
        self.endpoint.store(Some(Arc::new(endpoint.clone())));
        Ok(endpoint)
    }

    async fn discover(&self) -> Option<ServiceEndpoint> {
        if let Some(record) = DiscoveryRecord::read(&self.config.discovery_file).await {
            let candidate = ServiceEndpoint {
                host: record.host,
                port: record.port,
                api_key: record.api_key.or_else(|| self.config.api_key.clone()),
                pid: record.pid,
                owned: false,
            };
            if probe(&candidate).await {
                info!("Discovered running service at {}", candidate.base_url());
                return Some(candidate);
            }
            debug!(
                "Discovery file {} points at a dead service",
                self.config.discovery_file.display()
            );
        }

        for &port in &self.config.probe_ports {
            let candidate = ServiceEndpoint {
                host: self.config.host.clone(),
                port,
                api_key: self.config.api_key.clone(),
                pid: None,
                owned: false,
            };
            if probe(&candidate).await {
                info!("Found service by probing {}", candidate.base_url());
                return Some(candidate);
            }
        }
        None
    }

    async fn launch(&self) -> Result<ServiceEndpoint> {
        let binary = self.config.binary.as_ref().ok_or_else(|| {
            LifecycleError::ServiceLaunchFailed {
                exit_code: None,
                reason: "no running service found and no service executable configured".to_string(),
            }
        })?;

        let discovery_file = &self.config.discovery_file;
        DiscoveryRecord::remove(discovery_file).await;
        if let Some(parent) = discovery_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LifecycleError::io(parent, e))?;
        }

        let api_key = uuid::Uuid::new_v4().simple().to_string();
        info!("Launching service {}", binary.display());

        let mut cmd = Command::new(binary);
        cmd.args(&self.config.args)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg("0")
            .arg("--discovery-file")
            .arg(discovery_file)
            .arg("--api-key")
            .arg(&api_key)
            .env(DISCOVERY_ENV, discovery_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| LifecycleError::ServiceLaunchFailed {
            exit_code: None,
            reason: format!("failed to spawn {}: {}", binary.display(), e),
        })?;
        let pid = child.id();

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(LifecycleError::ServiceLaunchFailed {
                        exit_code: status.code(),
                        reason: format!("service exited during startup ({})", status),
                    });
                }
                Ok(None) => {}
                Err(e) => warn!("Could not poll service process: {}", e),
            }

            if let Some(record) = DiscoveryRecord::read(discovery_file).await {
                let endpoint = ServiceEndpoint {
                    host: record.host,
                    port: record.port,
                    api_key: record.api_key.or_else(|| Some(api_key.clone())),
                    pid: record.pid.or(pid),
                    owned: true,
                };
                if probe(&endpoint).await {
                    info!(
                        "Service started at {} after {:?}",
                        endpoint.base_url(),
                        started.elapsed()
                    );
                    *self.child.lock().await = Some(child);
                    return Ok(endpoint);
                }
            }

            if started.elapsed() >= self.config.startup_timeout {
                warn!("Service did not come up within {:?}, killing it", self.config.startup_timeout);
                let _ = child.kill().await;
                DiscoveryRecord::remove(discovery_file).await;
                return Err(LifecycleError::ServiceStartTimeout {
                    timeout: self.config.startup_timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Gracefully stop a service this locator launched. A discovered service
    /// is left running; only the association is dropped.
    pub async fn stop(&self) -> Result<()> {
        let endpoint = self.endpoint.swap(None);
        let child = self.child.lock().await.take();

        match endpoint {
            Some(ep) if ep.owned => {
                let client = HttpServiceClient::with_timeout(&ep, PROBE_TIMEOUT);
                if let Err(e) = client.shutdown().await {
                    debug!("Shutdown request failed: {}", e);
                }
                if let Some(mut child) = child {
                    match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
                        Ok(Ok(status)) => info!("Service exited ({})", status),
                        _ => {
                            warn!("Service ignored shutdown request, killing it");
                            kill(child).await;
                        }
                    }
                }
                DiscoveryRecord::remove(&self.config.discovery_file).await;
            }
            Some(ep) => {
                info!("Leaving discovered service at {} running", ep.base_url());
                if let Some(child) = child {
                    kill(child).await;
                }
            }
            None => {
                if let Some(child) = child {
                    kill(child).await;
                }
            }
        }
        Ok(())
    }

    /// Drop the launched process once its endpoint stopped answering. A child
    /// that is still alive is hung and gets killed.
    async fn retire_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => warn!("Launched service exited ({})", status),
            _ => {
                warn!("Launched service is unresponsive, killing it");
                kill(child).await;
            }
        }
    }
}

async fn kill(mut child: Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill service process: {}", e);
    }
}

async fn probe(endpoint: &ServiceEndpoint) -> bool {
    HttpServiceClient::with_timeout(endpoint, PROBE_TIMEOUT)
        .probe()
        .await
}
