//! Error types for model lifecycle operations.
//!
//! Every variant carries the identifiers needed to log and act on the failure
//! without re-deriving state (alias, variant id, HTTP status, byte offsets).

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    #[error("variant {variant_id} not found under alias {alias}")]
    VariantNotFound { alias: String, variant_id: String },

    #[error("no variant of {alias} is compatible with hardware {hardware}")]
    NoCompatibleVariant { alias: String, hardware: String },

    #[error("download of {variant_id} failed: {reason}")]
    DownloadFailed {
        variant_id: String,
        reason: String,
        /// HTTP status when the failure came from the remote side
        status: Option<u16>,
    },

    #[error(
        "integrity check failed for {variant_id}/{file}: expected {expected}, got {actual} ({bytes} bytes read)"
    )]
    IntegrityError {
        variant_id: String,
        file: String,
        expected: String,
        actual: String,
        bytes: u64,
    },

    #[error("variant {variant_id} is not cached")]
    NotCached { variant_id: String },

    #[error("service process failed to launch (exit code {exit_code:?}): {reason}")]
    ServiceLaunchFailed {
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("service did not publish its endpoint within {timeout:?}")]
    ServiceStartTimeout { timeout: Duration },

    #[error("service rejected {operation} of {variant_id} (HTTP {status}): {body}")]
    LoadRejected {
        operation: &'static str,
        variant_id: String,
        status: u16,
        body: String,
    },

    #[error("service request to {url} failed: {reason}")]
    ServiceRequest { url: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    OperationTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    #[error("lifecycle manager has been shut down")]
    ManagerClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl LifecycleError {
    pub fn catalog(reason: impl Into<String>) -> Self {
        Self::CatalogUnavailable {
            reason: reason.into(),
        }
    }

    pub fn download(variant_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DownloadFailed {
            variant_id: variant_id.into(),
            reason: reason.into(),
            status: None,
        }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether re-invoking the same operation may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed { .. }
                | Self::IntegrityError { .. }
                | Self::OperationTimeout { .. }
                | Self::ServiceRequest { .. }
                | Self::Cancelled { .. }
        )
    }

    /// Stable machine-readable code, shared with the language bindings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable { .. } => "CatalogUnavailable",
            Self::VariantNotFound { .. } => "VariantNotFound",
            Self::NoCompatibleVariant { .. } => "NoCompatibleVariant",
            Self::DownloadFailed { .. } => "DownloadFailed",
            Self::IntegrityError { .. } => "IntegrityError",
            Self::NotCached { .. } => "NotCached",
            Self::ServiceLaunchFailed { .. } => "ServiceLaunchFailed",
            Self::ServiceStartTimeout { .. } => "ServiceStartTimeout",
            Self::LoadRejected { .. } => "LoadRejected",
            Self::ServiceRequest { .. } => "ServiceRequest",
            Self::OperationTimeout { .. } => "OperationTimeout",
            Self::Cancelled { .. } => "Cancelled",
            Self::ManagerClosed => "ManagerClosed",
            Self::Config(_) => "Config",
            Self::Io { .. } => "Io",
        }
    }
}
