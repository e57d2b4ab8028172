pub mod cache_store;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gate;
pub mod hardware;
pub mod lifecycle;
pub mod selector;
pub mod service;
pub mod telemetry;

// Public API exports
pub use cache_store::{progress_channel, CacheEntry, CacheStore, DownloadProgress, ProgressReporter, ProgressUpdate};
pub use catalog::{Catalog, CatalogSnapshot, ModelVariant};
pub use config::Config;
pub use error::{LifecycleError, Result};
pub use gate::SerializationGate;
pub use hardware::{HardwareProfile, HardwareTier};
pub use lifecycle::{
    LifecycleEvent, LifecycleManager, LoadedModelHandle, ModelStatus, OperationOptions,
};
pub use service::{ServiceEndpoint, ServiceLocator};

/// Re-exported so callers can build `OperationOptions` without a direct dependency.
pub use tokio_util::sync::CancellationToken;
