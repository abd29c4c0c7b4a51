use std::path::Path;

use serde::Deserialize;

use crate::dispatcher::DispatcherConfig;
use crate::retry::RetryPolicy;
use crate::summary::SummaryConfig;

/// Top-level relay configuration. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub redis_url: String,
    /// Prefix for every key the relay owns.
    pub key_prefix: String,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryPolicy,
    pub summary: SummaryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "payments".to_string(),
            dispatcher: DispatcherConfig::default(),
            retry: RetryPolicy::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load from `config/relay.*` (optional) overlaid with `RELAY_*`
    /// environment variables, e.g. `RELAY_DISPATCHER__BATCH_SIZE=20`.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("config/relay").required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Load from a specific file, still overlaid with the environment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("RELAY")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
