// Lock catalog configuration
// Immutable settings fixed when the catalog is constructed

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::schema::{CONFIG_DB, LOCK_PINGS_COLL, LOCKS_COLL, Namespace};

const ENV_PREFIX: &str = "DISTLOCK";

/// Configuration for the lock catalog
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DistLockCatalogConfig {
    /// How long a mutation waits for majority acknowledgement (default: 15000ms)
    pub write_concern_timeout_ms: u64,

    /// Collection holding one document per named lock
    pub locks_namespace: Namespace,

    /// Collection holding one heartbeat document per process
    pub lock_pings_namespace: Namespace,
}

impl Default for DistLockCatalogConfig {
    fn default() -> Self {
        Self {
            write_concern_timeout_ms: 15000,
            locks_namespace: Namespace::new(CONFIG_DB, LOCKS_COLL),
            lock_pings_namespace: Namespace::new(CONFIG_DB, LOCK_PINGS_COLL),
        }
    }
}

impl DistLockCatalogConfig {
    pub fn new(write_concern_timeout_ms: u64) -> Self {
        Self {
            write_concern_timeout_ms,
            ..Default::default()
        }
    }

    /// Load from an optional file, overridden by `DISTLOCK_*` environment
    /// variables (e.g. `DISTLOCK_WRITE_CONCERN_TIMEOUT_MS`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Get write concern timeout as Duration
    pub fn write_concern_timeout(&self) -> Duration {
        Duration::from_millis(self.write_concern_timeout_ms)
    }
}
