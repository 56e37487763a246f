//! Runtime configuration

use serde::Deserialize;

use tabmesh_core::{MeshError, MeshResult};
use tabmesh_transport::{HubConfig, NetworkConfig, QueueConfig};

use crate::{DispatcherConfig, LogConfig, DEFAULT_SEEN_CAPACITY};

/// Which transports a context brings up at startup
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportsConfig {
    pub local_bus: bool,
    pub hub: Option<HubConfig>,
    pub network: Option<NetworkConfig>,
}

impl Default for TransportsConfig {
    fn default() -> Self {
        TransportsConfig {
            local_bus: true,
            hub: None,
            network: None,
        }
    }
}

/// Top-level configuration of one sync context
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Loop-guard id override; the tab id is used when unset
    pub context_id: Option<String>,
    pub relay_inbound: bool,
    pub seen_capacity: usize,
    pub log: LogConfig,
    pub transports: TransportsConfig,
    pub queue: QueueConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            context_id: None,
            relay_inbound: true,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            log: LogConfig::default(),
            transports: TransportsConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> MeshResult<Self> {
        serde_json::from_str(json).map_err(|e| MeshError::Config(e.to_string()))
    }

    pub fn with_hub(mut self, hub: HubConfig) -> Self {
        self.transports.hub = Some(hub);
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.transports.network = Some(network);
        self
    }

    pub fn without_local_bus(mut self) -> Self {
        self.transports.local_bus = false;
        self
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            context_id: self.context_id.clone(),
            relay_inbound: self.relay_inbound,
            seen_capacity: self.seen_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.relay_inbound);
        assert!(config.transports.local_bus);
        assert!(config.transports.hub.is_none());
        assert_eq!(config.queue.max_queued, 1000);
    }

    #[test]
    fn test_from_json_partial() {
        let config = RuntimeConfig::from_json(
            r#"{
                "relay_inbound": false,
                "log": {"level": "debug"},
                "transports": {
                    "hub": {"addr": "127.0.0.1:9000"},
                    "network": {"url": "wss://sync.example.com/ws", "room_id": "canvas-1"}
                },
                "queue": {"max_queued": 10}
            }"#,
        )
        .unwrap();

        assert!(!config.relay_inbound);
        assert_eq!(config.log.level, "debug");
        assert!(config.transports.local_bus);
        assert_eq!(config.transports.hub.as_ref().unwrap().addr, "127.0.0.1:9000");
        let network = config.transports.network.as_ref().unwrap();
        assert_eq!(network.room_id.as_deref(), Some("canvas-1"));
        assert_eq!(network.reconnect.max_attempts, 10);
        assert_eq!(config.queue.max_queued, 10);
        assert!(!config.dispatcher().relay_inbound);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            RuntimeConfig::from_json("{\"relay_inbound\": 3}"),
            Err(MeshError::Config(_))
        ));
    }
}
