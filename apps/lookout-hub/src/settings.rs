use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Where the hub reads the chain node URL from.
///
/// Read once per session start, so updates apply on the next (re)start rather than to a live
/// session. An empty URL means the node is not configured.
pub trait SettingsSource: Send + Sync + 'static {
    fn node_url(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSettings {
    pub node_url: String,
}

impl HubSettings {
    pub fn new(node_url: impl Into<String>) -> Self {
        Self {
            node_url: node_url.into(),
        }
    }
}

/// In-memory settings shared between the hub and the settings API.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<HubSettings>>,
}

impl SharedSettings {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> HubSettings {
        self.inner.read().clone()
    }

    pub fn set_node_url(&self, node_url: impl Into<String>) -> HubSettings {
        let mut guard = self.inner.write();
        guard.node_url = node_url.into();
        guard.clone()
    }
}

impl SettingsSource for SharedSettings {
    fn node_url(&self) -> String {
        self.inner.read().node_url.clone()
    }
}
