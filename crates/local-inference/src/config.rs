use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::{BundledManifest, ManifestSource, RemoteManifest};
use crate::hardware::HardwareTier;
use crate::service::ServiceConfig;

const SERVICE_BIN_NAME: &str = "local-inference-service";

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub catalog_url: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub service_bin: Option<PathBuf>,
    pub service_args: Vec<String>,
    pub host: String,
    pub discovery_file: PathBuf,
    pub probe_ports: Vec<u16>,
    pub api_key: Option<String>,
    pub startup_timeout_seconds: u64,
    pub download_timeout_seconds: u64,
    pub load_timeout_seconds: u64,
    pub stop_grace_seconds: u64,
    pub hardware: Option<HardwareTier>,
}

impl Default for Config {
    fn default() -> Self {
        let cache_dir = default_cache_dir();
        Self {
            discovery_file: cache_dir.join("service.json"),
            cache_dir,
            catalog_url: None,
            catalog_path: None,
            service_bin: None,
            service_args: Vec::new(),
            host: "127.0.0.1".to_string(),
            probe_ports: Vec::new(),
            api_key: None,
            startup_timeout_seconds: 60,
            download_timeout_seconds: 3600,
            load_timeout_seconds: 600,
            stop_grace_seconds: 5,
            hardware: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let cache_dir = env::var("LOCAL_INFERENCE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_cache_dir());

        let discovery_file = env::var("LOCAL_INFERENCE_DISCOVERY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cache_dir.join("service.json"));

        let service_bin = match env::var("LOCAL_INFERENCE_SERVICE_BIN") {
            Ok(bin) => {
                let path = PathBuf::from(&bin);
                if !path.exists() {
                    return Err(anyhow::anyhow!(
                        "Service binary not found at: {}. Please check LOCAL_INFERENCE_SERVICE_BIN.",
                        bin
                    ));
                }
                Some(path)
            }
            Err(_) => match which::which(SERVICE_BIN_NAME) {
                Ok(path) => {
                    info!("Using service binary from PATH: {}", path.display());
                    Some(path)
                }
                Err(_) => {
                    info!("No service binary configured; only running services will be used");
                    None
                }
            },
        };

        let hardware = match env::var("LOCAL_INFERENCE_HARDWARE") {
            Ok(tier) if !tier.trim().is_empty() && tier.trim() != "auto" => Some(
                tier.parse::<HardwareTier>()
                    .map_err(anyhow::Error::msg)
                    .context("Invalid LOCAL_INFERENCE_HARDWARE")?,
            ),
            _ => None,
        };

        let probe_ports = match env::var("LOCAL_INFERENCE_PROBE_PORTS") {
            Ok(ports) => parse_ports(&ports).context("Invalid LOCAL_INFERENCE_PROBE_PORTS")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            cache_dir,
            catalog_url: non_empty_var("LOCAL_INFERENCE_CATALOG_URL"),
            catalog_path: non_empty_var("LOCAL_INFERENCE_CATALOG_PATH").map(PathBuf::from),
            service_bin,
            service_args: env::var("LOCAL_INFERENCE_SERVICE_ARGS")
                .map(|a| a.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            host: env::var("LOCAL_INFERENCE_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            discovery_file,
            probe_ports,
            api_key: non_empty_var("LOCAL_INFERENCE_API_KEY"),
            startup_timeout_seconds: env::var("LOCAL_INFERENCE_STARTUP_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "60".into())
                .parse()
                .context("Invalid LOCAL_INFERENCE_STARTUP_TIMEOUT_SECONDS")?,
            download_timeout_seconds: env::var("LOCAL_INFERENCE_DOWNLOAD_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "3600".into())
                .parse()
                .context("Invalid LOCAL_INFERENCE_DOWNLOAD_TIMEOUT_SECONDS")?,
            load_timeout_seconds: env::var("LOCAL_INFERENCE_LOAD_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "600".into())
                .parse()
                .context("Invalid LOCAL_INFERENCE_LOAD_TIMEOUT_SECONDS")?,
            stop_grace_seconds: env::var("LOCAL_INFERENCE_STOP_GRACE_SECONDS")
                .unwrap_or_else(|_| "5".into())
                .parse()
                .context("Invalid LOCAL_INFERENCE_STOP_GRACE_SECONDS")?,
            hardware,
        })
    }

    /// A manager needs at least one place to read the catalog from.
    pub fn validate(&self) -> Result<()> {
        if self.catalog_url.is_none() && self.catalog_path.is_none() {
            anyhow::bail!(
                "No catalog source configured. Set LOCAL_INFERENCE_CATALOG_URL or LOCAL_INFERENCE_CATALOG_PATH."
            );
        }
        if self.startup_timeout_seconds == 0
            || self.download_timeout_seconds == 0
            || self.load_timeout_seconds == 0
        {
            anyhow::bail!("Timeouts must be greater than zero");
        }
        Ok(())
    }

    /// Remote source first, bundled manifest as fallback.
    pub fn catalog_sources(&self) -> Vec<Box<dyn ManifestSource>> {
        let mut sources: Vec<Box<dyn ManifestSource>> = Vec::new();
        if let Some(url) = &self.catalog_url {
            sources.push(Box::new(RemoteManifest::new(url.clone())));
        }
        if let Some(path) = &self.catalog_path {
            sources.push(Box::new(BundledManifest::new(path.clone())));
        }
        sources
    }

    pub fn catalog_snapshot_path(&self) -> PathBuf {
        self.cache_dir.join("catalog.json")
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            binary: self.service_bin.clone(),
            args: self.service_args.clone(),
            host: self.host.clone(),
            discovery_file: self.discovery_file.clone(),
            probe_ports: self.probe_ports.clone(),
            api_key: self.api_key.clone(),
            startup_timeout: Duration::from_secs(self.startup_timeout_seconds),
            stop_grace: Duration::from_secs(self.stop_grace_seconds),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_seconds)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Cache Dir: {}", self.cache_dir.display());
        info!("- Catalog URL: {}", self.catalog_url.as_deref().unwrap_or("<none>"));
        info!(
            "- Catalog Path: {}",
            self.catalog_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<none>".into())
        );
        info!(
            "- Service Binary: {}",
            self.service_bin
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<discover only>".into())
        );
        info!("- Service Host: {}", self.host);
        info!("- Discovery File: {}", self.discovery_file.display());
        info!("- Probe Ports: {:?}", self.probe_ports);
        info!("- API Key: {}", if self.api_key.is_some() { "set" } else { "unset" });
        info!(
            "- Timeouts: startup {}s, download {}s, load {}s",
            self.startup_timeout_seconds, self.download_timeout_seconds, self.load_timeout_seconds
        );
        info!(
            "- Hardware: {}",
            self.hardware
                .map(|t| t.to_string())
                .unwrap_or_else(|| "auto".into())
        );
    }
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "local-inference")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| env::temp_dir().join("local-inference"))
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_ports(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u16>().with_context(|| format!("'{}' is not a port", p)))
        .collect()
}
