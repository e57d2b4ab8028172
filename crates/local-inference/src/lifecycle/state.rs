//! Loaded-model handles and the set the manager tracks them in.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl ModelStatus {
    /// Forward edges of the handle state machine. Removal is not a status and
    /// is allowed from any state.
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Loading, Ready) | (Loading, Failed) | (Ready, Unloading)
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModelHandle {
    pub variant_id: String,
    pub alias: String,
    pub loaded_at: DateTime<Utc>,
    pub status: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LoadedModelHandle {
    pub fn loading(variant_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            variant_id: variant_id.into(),
            alias: alias.into(),
            loaded_at: Utc::now(),
            status: ModelStatus::Loading,
            message: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ModelStatus::Ready
    }
}

/// Handles currently associated with the service.
///
/// Readers take lock-free snapshots. Writers run inside the serialization gate,
/// so updates never race each other.
#[derive(Default)]
pub struct LoadedSet {
    handles: ArcSwap<Vec<LoadedModelHandle>>,
}

impl LoadedSet {
    pub fn snapshot(&self) -> Vec<LoadedModelHandle> {
        self.handles.load().as_ref().clone()
    }

    pub fn get(&self, variant_id: &str) -> Option<LoadedModelHandle> {
        self.handles
            .load()
            .iter()
            .find(|h| h.variant_id == variant_id)
            .cloned()
    }

    /// Insert a fresh handle, replacing any previous handle for the same variant.
    pub fn insert(&self, handle: LoadedModelHandle) {
        self.handles.rcu(|current| {
            let mut next: Vec<LoadedModelHandle> = current
                .iter()
                .filter(|h| h.variant_id != handle.variant_id)
                .cloned()
                .collect();
            next.push(handle.clone());
            next
        });
    }

    /// Move a handle forward. Returns the updated handle, or `None` when the
    /// handle is absent or the edge is not allowed.
    pub fn transition(
        &self,
        variant_id: &str,
        next: ModelStatus,
        message: Option<String>,
    ) -> Option<LoadedModelHandle> {
        let current = self.get(variant_id)?;
        if !current.status.can_transition_to(next) {
            warn!(
                "Ignoring {} -> {} for {}",
                current.status, next, variant_id
            );
            return None;
        }
        let updated = LoadedModelHandle {
            status: next,
            message,
            ..current
        };
        self.handles.rcu(|handles| {
            handles
                .iter()
                .map(|h| {
                    if h.variant_id == variant_id {
                        updated.clone()
                    } else {
                        h.clone()
                    }
                })
                .collect::<Vec<_>>()
        });
        Some(updated)
    }

    pub fn remove(&self, variant_id: &str) -> Option<LoadedModelHandle> {
        let removed = self.get(variant_id)?;
        self.handles.rcu(|handles| {
            handles
                .iter()
                .filter(|h| h.variant_id != variant_id)
                .cloned()
                .collect::<Vec<_>>()
        });
        Some(removed)
    }

    pub fn clear(&self) -> Vec<LoadedModelHandle> {
        self.handles.swap(Arc::new(Vec::new())).as_ref().clone()
    }
}
