//! Lifecycle manager: the caller-facing surface.
//!
//! Every mutating operation runs inside the serialization gate, so downloads,
//! loads, unloads and service starts never overlap for one manager. Operation
//! bodies only call the unguarded helpers below; calling a public gated method
//! from inside a body would deadlock.
//!
//! A timed-out or cancelled operation rolls back before the gate is released:
//! staging directories are removed by their guard, and a handle still in
//! `Loading` is unloaded from the service and then marked `Failed` (timeout) or
//! dropped (cancellation).

pub mod events;
pub mod state;

pub use events::LifecycleEvent;
pub use state::{LoadedModelHandle, LoadedSet, ModelStatus};

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache_store::{CacheEntry, CacheStore, ProgressReporter};
use crate::catalog::{Catalog, CatalogSnapshot, ModelVariant};
use crate::config::Config;
use crate::error::{LifecycleError, Result};
use crate::gate::SerializationGate;
use crate::hardware::{HardwareProfile, HardwareTier};
use crate::selector;
use crate::service::{
    HttpServiceClient, ServiceEndpoint, ServiceLocator, ServiceModelState, ServiceModelStatus,
};

const EVENT_CAPACITY: usize = 64;
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call timeout and cancellation. Unset fields fall back to the
/// configured timeout for the operation and a token nobody cancels.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl OperationOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub struct LifecycleManager {
    config: Config,
    hardware: HardwareProfile,
    catalog: Catalog,
    cache: CacheStore,
    locator: ServiceLocator,
    gate: SerializationGate,
    loaded: LoadedSet,
    events: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleManager {
    /// Build a manager, detecting hardware unless the configuration pins a tier.
    pub async fn new(config: Config) -> Result<Self> {
        let hardware = match config.hardware {
            Some(tier) => {
                info!("Hardware pinned to {} by configuration", tier);
                HardwareProfile::for_tier(tier)
            }
            None => tokio::task::spawn_blocking(HardwareProfile::detect)
                .await
                .unwrap_or_else(|e| {
                    warn!("Hardware detection failed ({}), assuming CPU", e);
                    HardwareProfile::for_tier(HardwareTier::Cpu)
                }),
        };
        Self::with_hardware(config, hardware).await
    }

    pub async fn with_hardware(config: Config, hardware: HardwareProfile) -> Result<Self> {
        config
            .validate()
            .map_err(|e| LifecycleError::Config(e.to_string()))?;

        let cache = CacheStore::open(config.cache_dir.clone()).await?;
        let catalog = Catalog::new(
            config.catalog_sources(),
            Some(config.catalog_snapshot_path()),
        );
        let locator = ServiceLocator::new(config.service_config());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            hardware,
            catalog,
            cache,
            locator,
            gate: SerializationGate::new(),
            loaded: LoadedSet::default(),
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hardware(&self) -> &HardwareProfile {
        &self.hardware
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Point-in-time copy of the loaded set. Not gated.
    pub fn list_loaded(&self) -> Vec<LoadedModelHandle> {
        self.loaded.snapshot()
    }

    /// Endpoint of the service this manager is talking to, if any.
    pub fn endpoint(&self) -> Option<ServiceEndpoint> {
        self.locator.endpoint()
    }

    pub fn api_key(&self) -> Option<String> {
        self.locator.endpoint().and_then(|e| e.api_key)
    }

    /// Pre-flight hint only; may be stale by the time a download runs.
    pub fn is_cached(&self, variant_id: &str) -> bool {
        self.cache.is_cached(variant_id)
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    pub async fn refresh_catalog(&self) -> Result<CatalogSnapshot> {
        self.catalog.refresh().await
    }

    pub async fn variants(&self, alias: &str) -> Result<Vec<ModelVariant>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.find_variants(alias).into_iter().cloned().collect())
    }

    /// The variant `init` would pick, without acting on it.
    pub async fn select_variant(
        &self,
        alias: &str,
        hardware: Option<HardwareTier>,
    ) -> Result<ModelVariant> {
        self.resolve(alias, hardware, None).await
    }

    pub async fn init(
        &self,
        alias: &str,
        hardware: Option<HardwareTier>,
    ) -> Result<LoadedModelHandle> {
        self.init_with(alias, hardware, OperationOptions::default())
            .await
    }

    /// Resolve, start the service, download and load `alias`.
    pub async fn init_with(
        &self,
        alias: &str,
        hardware: Option<HardwareTier>,
        options: OperationOptions,
    ) -> Result<LoadedModelHandle> {
        let default_timeout = self.config.startup_timeout()
            + self.config.download_timeout()
            + self.config.load_timeout();
        self.run_gated("init", options, default_timeout, || async {
            let variant = self.resolve(alias, hardware, None).await?;
            let endpoint = self.ensure_service().await?;
            let entry = self.download_variant(&variant, None).await?;
            self.load_variant(&endpoint, &variant, &entry).await
        })
        .await
    }

    pub async fn download(&self, alias: &str) -> Result<CacheEntry> {
        self.download_with(alias, OperationOptions::default(), None)
            .await
    }

    /// Resolve and cache `alias` without loading it.
    pub async fn download_with(
        &self,
        alias: &str,
        options: OperationOptions,
        progress: Option<ProgressReporter>,
    ) -> Result<CacheEntry> {
        self.run_gated("download", options, self.config.download_timeout(), || async move {
            let variant = self.resolve(alias, None, None).await?;
            self.download_variant(&variant, progress).await
        })
        .await
    }

    pub async fn load(&self, variant_id: &str) -> Result<LoadedModelHandle> {
        self.load_with(variant_id, OperationOptions::default()).await
    }

    /// Load an already cached variant, unloading whatever else is loaded first.
    pub async fn load_with(
        &self,
        variant_id: &str,
        options: OperationOptions,
    ) -> Result<LoadedModelHandle> {
        let default_timeout = self.config.startup_timeout() + self.config.load_timeout();
        self.run_gated("load", options, default_timeout, || async {
            let snapshot = self.snapshot().await?;
            let variant = snapshot.find_variant(variant_id).cloned().ok_or_else(|| {
                LifecycleError::VariantNotFound {
                    alias: "*".to_string(),
                    variant_id: variant_id.to_string(),
                }
            })?;
            let entry = self
                .cache
                .lookup(&variant)
                .await?
                .ok_or_else(|| LifecycleError::NotCached {
                    variant_id: variant_id.to_string(),
                })?;
            let endpoint = self.ensure_service().await?;
            self.load_variant(&endpoint, &variant, &entry).await
        })
        .await
    }

    /// Unloading a variant that is not loaded succeeds without doing anything.
    pub async fn unload(&self, variant_id: &str) -> Result<()> {
        self.run_gated(
            "unload",
            OperationOptions::default(),
            self.config.load_timeout(),
            || self.unload_variant(variant_id),
        )
        .await
    }

    /// Remove a variant from the cache, unloading it first if loaded.
    pub async fn evict(&self, variant_id: &str) -> Result<()> {
        self.run_gated(
            "evict",
            OperationOptions::default(),
            self.config.load_timeout(),
            || async {
                if self.loaded.get(variant_id).is_some() {
                    self.unload_variant(variant_id).await?;
                }
                self.cache.evict(variant_id).await
            },
        )
        .await
    }

    /// Unload everything, stop a service this manager launched, and close the
    /// gate for good. Later calls fail with `ManagerClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.gate
            .close_after(|| async {
                info!("Shutting down lifecycle manager");
                for handle in self.loaded.snapshot() {
                    let unload = tokio::time::timeout(
                        self.config.load_timeout(),
                        self.unload_variant(&handle.variant_id),
                    )
                    .await;
                    match unload {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Unload of {} during shutdown failed: {}", handle.variant_id, e),
                        Err(_) => warn!("Unload of {} during shutdown timed out", handle.variant_id),
                    }
                }
                for handle in self.loaded.clear() {
                    self.emit(LifecycleEvent::Unloaded {
                        variant_id: handle.variant_id,
                    });
                }

                if let Some(endpoint) = self.locator.endpoint() {
                    self.locator.stop().await?;
                    if endpoint.owned {
                        self.emit(LifecycleEvent::ServiceStopped {
                            base_url: endpoint.base_url(),
                        });
                    }
                }
                Ok(())
            })
            .await
    }

    async fn run_gated<T, F, Fut>(
        &self,
        operation: &'static str,
        options: OperationOptions,
        default_timeout: Duration,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
        let timeout = options.timeout.unwrap_or(default_timeout);

        let body_cancel = cancel.clone();
        self.gate
            .with_exclusive_or_cancel(operation, &cancel, move || async move {
                let result = tokio::select! {
                    biased;
                    _ = body_cancel.cancelled() => Err(LifecycleError::Cancelled { operation }),
                    outcome = tokio::time::timeout(timeout, body()) => {
                        outcome.unwrap_or_else(|_| {
                            Err(LifecycleError::OperationTimeout { operation, after: timeout })
                        })
                    }
                };
                if let Err(
                    e @ (LifecycleError::Cancelled { .. } | LifecycleError::OperationTimeout { .. }),
                ) = &result
                {
                    warn!("{} aborted: {}", operation, e);
                    self.roll_back(e).await;
                }
                result
            })
            .await
    }

    /// Undo a load the aborted body left half-done.
    async fn roll_back(&self, cause: &LifecycleError) {
        let pending: Vec<LoadedModelHandle> = self
            .loaded
            .snapshot()
            .into_iter()
            .filter(|h| h.status == ModelStatus::Loading)
            .collect();
        if pending.is_empty() {
            return;
        }

        let client = self
            .locator
            .endpoint()
            .map(|ep| HttpServiceClient::with_timeout(&ep, ROLLBACK_TIMEOUT));

        for handle in pending {
            if let Some(client) = &client {
                if let Err(e) = client.unload(&handle.variant_id).await {
                    debug!("Rollback unload of {} failed: {}", handle.variant_id, e);
                }
            }
            if matches!(cause, LifecycleError::Cancelled { .. }) {
                self.loaded.remove(&handle.variant_id);
                self.emit(LifecycleEvent::Unloaded {
                    variant_id: handle.variant_id,
                });
            } else {
                self.loaded
                    .transition(&handle.variant_id, ModelStatus::Failed, Some(cause.to_string()));
                self.emit(LifecycleEvent::Failed {
                    variant_id: handle.variant_id,
                    reason: cause.to_string(),
                });
            }
        }
    }

    async fn snapshot(&self) -> Result<CatalogSnapshot> {
        match self.catalog.current() {
            Some(snapshot) => Ok(snapshot),
            None => self.catalog.refresh().await,
        }
    }

    async fn resolve(
        &self,
        alias: &str,
        hardware: Option<HardwareTier>,
        explicit_variant_id: Option<&str>,
    ) -> Result<ModelVariant> {
        let snapshot = self.snapshot().await?;
        let pinned = hardware.map(HardwareProfile::for_tier);
        let profile = pinned.as_ref().unwrap_or(&self.hardware);
        let variant = selector::select(&snapshot, alias, profile, explicit_variant_id)?;
        info!("Resolved {} to {} for {}", alias, variant.id, profile.tier);
        Ok(variant.clone())
    }

    async fn ensure_service(&self) -> Result<ServiceEndpoint> {
        let previous = self.locator.endpoint();
        let endpoint = self.locator.ensure_running().await?;

        if previous.as_ref() != Some(&endpoint) {
            if previous.is_some() {
                let stale = self.loaded.clear();
                if !stale.is_empty() {
                    warn!(
                        "Service endpoint changed, dropping {} stale handle(s)",
                        stale.len()
                    );
                }
                for handle in stale {
                    self.emit(LifecycleEvent::Unloaded {
                        variant_id: handle.variant_id,
                    });
                }
            }
            self.emit(LifecycleEvent::ServiceStarted {
                base_url: endpoint.base_url(),
                owned: endpoint.owned,
            });
        }
        Ok(endpoint)
    }

    async fn download_variant(
        &self,
        variant: &ModelVariant,
        progress: Option<ProgressReporter>,
    ) -> Result<CacheEntry> {
        let fetching = !self.cache.is_cached(&variant.id);
        if fetching {
            self.emit(LifecycleEvent::Downloading {
                variant_id: variant.id.clone(),
                bytes_total: variant.total_size(),
            });
        }

        let entry = self.cache.ensure_downloaded(variant, progress).await.map_err(|e| {
            error!("Download of {} failed: {}", variant.id, e);
            e
        })?;

        if fetching {
            self.emit(LifecycleEvent::Downloaded {
                variant_id: variant.id.clone(),
            });
        }
        Ok(entry)
    }

    async fn load_variant(
        &self,
        endpoint: &ServiceEndpoint,
        variant: &ModelVariant,
        entry: &CacheEntry,
    ) -> Result<LoadedModelHandle> {
        for other in self.loaded.snapshot() {
            if other.variant_id != variant.id {
                info!("Superseding {} with {}", other.variant_id, variant.id);
                self.unload_variant(&other.variant_id).await?;
            }
        }

        if let Some(existing) = self.loaded.get(&variant.id) {
            if existing.is_ready() {
                debug!("{} is already loaded", variant.id);
                return Ok(existing);
            }
        }

        let handle = LoadedModelHandle::loading(&variant.id, &variant.alias);
        self.loaded.insert(handle.clone());
        self.emit(LifecycleEvent::Loading {
            variant_id: variant.id.clone(),
        });
        info!("Loading {} from {}", variant.id, entry.path.display());

        let client = HttpServiceClient::with_timeout(endpoint, self.config.load_timeout());
        let outcome = match client.load(&variant.id, &entry.path).await {
            Ok(state) => await_ready(&client, &variant.id, state).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                let ready = self
                    .loaded
                    .transition(&variant.id, ModelStatus::Ready, None)
                    .unwrap_or(LoadedModelHandle {
                        status: ModelStatus::Ready,
                        ..handle
                    });
                info!("{} is ready", variant.id);
                self.emit(LifecycleEvent::Ready {
                    variant_id: variant.id.clone(),
                });
                Ok(ready)
            }
            Err(e) => {
                error!("Load of {} failed: {}", variant.id, e);
                self.loaded
                    .transition(&variant.id, ModelStatus::Failed, Some(e.to_string()));
                self.emit(LifecycleEvent::Failed {
                    variant_id: variant.id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn unload_variant(&self, variant_id: &str) -> Result<()> {
        let Some(handle) = self.loaded.get(variant_id) else {
            debug!("{} is not loaded, nothing to unload", variant_id);
            return Ok(());
        };

        if let Some(endpoint) = self.locator.endpoint() {
            if handle.status == ModelStatus::Ready {
                self.loaded
                    .transition(variant_id, ModelStatus::Unloading, None);
            }
            self.emit(LifecycleEvent::Unloading {
                variant_id: variant_id.to_string(),
            });
            info!("Unloading {}", variant_id);
            HttpServiceClient::with_timeout(&endpoint, self.config.load_timeout())
                .unload(variant_id)
                .await?;
        }

        self.loaded.remove(variant_id);
        self.emit(LifecycleEvent::Unloaded {
            variant_id: variant_id.to_string(),
        });
        Ok(())
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Follow a `loading` answer until the service reports a final state.
async fn await_ready(
    client: &HttpServiceClient,
    variant_id: &str,
    initial: ServiceModelState,
) -> Result<()> {
    let mut state = initial;
    loop {
        match state.status {
            ServiceModelStatus::Ready => return Ok(()),
            ServiceModelStatus::Failed | ServiceModelStatus::Unloaded => {
                return Err(LifecycleError::LoadRejected {
                    operation: "load",
                    variant_id: variant_id.to_string(),
                    status: 200,
                    body: state
                        .message
                        .unwrap_or_else(|| format!("service reported {:?}", state.status)),
                });
            }
            ServiceModelStatus::Loading => {
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                let status = client.status().await?;
                state = status
                    .model(variant_id)
                    .cloned()
                    .unwrap_or(ServiceModelState {
                        variant_id: variant_id.to_string(),
                        status: ServiceModelStatus::Loading,
                        message: None,
                    });
            }
        }
    }
}
