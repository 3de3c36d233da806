//! Counter Peer Configuration

use serde::{Deserialize, Serialize};
use shared_store::ReplicationConfig;
use std::path::Path;

/// Peer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Address the host listens on and guests connect to
    pub addr: String,
    /// Application identity; peers only share state with the same app id
    pub app_id: String,
    /// Guest bootstrap timeout in milliseconds
    pub bootstrap_timeout_ms: u64,
    /// Buffered state updates per subscriber
    pub event_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9300".to_string(),
            app_id: "counter".to_string(),
            bootstrap_timeout_ms: 10_000,
            event_capacity: 1000,
        }
    }
}

impl PeerConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            app_id: self.app_id.clone(),
            bootstrap_timeout_ms: self.bootstrap_timeout_ms,
            event_capacity: self.event_capacity,
        }
    }
}
