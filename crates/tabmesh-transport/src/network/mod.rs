//! Network transport
//!
//! Duplex text socket to a remote sync service. Credentials travel in the
//! first frame after the socket opens, never in the URL.

mod client;
mod connector;
mod frame;

use std::time::Duration;

use serde::Deserialize;

pub use client::{NetworkTransport, PresenceHandler, RemotePresence};
pub use connector::{
    MemoryConnector, MemoryServer, MemorySocketPeer, NetworkConnector, NetworkSocket, WsConnector,
};
pub use frame::NetFrame;

/// Reconnection behavior
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ReconnectConfig {
    /// 0 retries forever
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized away, in `[0, 1]`
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.3,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
///
/// `base * 2^(attempt-1)` capped at `max_delay_ms`, then reduced by up to
/// `jitter` of itself according to `jitter_sample` in `[0, 1)`. The result
/// never exceeds `max_delay_ms`.
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig, jitter_sample: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let raw = config.base_delay_ms.saturating_mul(1u64 << exponent);
    let capped = raw.min(config.max_delay_ms) as f64;

    let jitter = config.jitter.clamp(0.0, 1.0);
    let sample = jitter_sample.clamp(0.0, 1.0);
    let delay = capped * (1.0 - jitter * sample);
    Duration::from_millis(delay.round() as u64)
}

/// Network transport settings
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct NetworkConfig {
    pub url: String,
    /// Sent in the `auth` frame after the socket opens
    pub auth_token: Option<String>,
    /// A configured room makes the transport canvas-scoped
    pub room_id: Option<String>,
    pub heartbeat_interval_ms: u64,
    /// Bound on each handshake step (auth, room join)
    pub handshake_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            url: "ws://127.0.0.1:7421/sync".to_string(),
            auth_token: None,
            room_id: None,
            heartbeat_interval_ms: 10_000,
            handshake_timeout_ms: 5_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        NetworkConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl std::fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("room_id", &self.room_id)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.5,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = config();
        assert_eq!(backoff_delay(1, &config, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, &config, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, &config, 0.0), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, &config, 0.0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(40, &config, 0.0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_reduces() {
        let config = config();
        assert_eq!(backoff_delay(1, &config, 1.0), Duration::from_millis(50));
        assert_eq!(backoff_delay(5, &config, 0.5), Duration::from_millis(750));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = NetworkConfig::new("ws://x").with_auth_token("secret-token");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    proptest! {
        #[test]
        fn prop_backoff_bounded(attempt in 0u32..200, sample in 0.0f64..1.0, jitter in 0.0f64..1.0) {
            let config = ReconnectConfig { jitter, ..config() };
            let delay = backoff_delay(attempt, &config, sample);
            prop_assert!(delay <= Duration::from_millis(config.max_delay_ms));
        }
    }
}
