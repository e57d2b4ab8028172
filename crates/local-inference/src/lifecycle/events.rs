use serde::Serialize;

/// Lifecycle transitions broadcast to subscribers, in the order they happen.
///
/// Superseding a loaded model appears as `Unloading(a)`, `Unloaded(a)`,
/// `Loading(b)`, then `Ready(b)` or `Failed(b)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    ServiceStarted {
        base_url: String,
        owned: bool,
    },
    #[serde(rename_all = "camelCase")]
    ServiceStopped {
        base_url: String,
    },
    #[serde(rename_all = "camelCase")]
    Downloading {
        variant_id: String,
        bytes_total: u64,
    },
    #[serde(rename_all = "camelCase")]
    Downloaded { variant_id: String },
    #[serde(rename_all = "camelCase")]
    Loading { variant_id: String },
    #[serde(rename_all = "camelCase")]
    Ready { variant_id: String },
    #[serde(rename_all = "camelCase")]
    Failed { variant_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    Unloading { variant_id: String },
    #[serde(rename_all = "camelCase")]
    Unloaded { variant_id: String },
}

impl LifecycleEvent {
    pub fn variant_id(&self) -> Option<&str> {
        match self {
            Self::Downloading { variant_id, .. }
            | Self::Downloaded { variant_id }
            | Self::Loading { variant_id }
            | Self::Ready { variant_id }
            | Self::Failed { variant_id, .. }
            | Self::Unloading { variant_id }
            | Self::Unloaded { variant_id } => Some(variant_id),
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => None,
        }
    }
}
