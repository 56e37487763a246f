//! Logging setup
//!
//! Libraries only emit `tracing` events. Binaries and host applications call
//! `init_logging` once at startup.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use tabmesh_core::{MeshError, MeshResult};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn filter(&self) -> MeshResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| MeshError::Config(format!("invalid log level {:?}: {}", self.level, e))),
        }
    }
}

/// Install the global subscriber
///
/// Fails if the level directive is invalid or a subscriber is already set.
pub fn init_logging(config: &LogConfig) -> MeshResult<()> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| MeshError::Config(format!("logging already initialized: {}", e)))
}
