//! Ambient runtime tunables: queue capacity, fan-out caps, timeouts, and the
//! pricing-table path.
//!
//! Grounded on SPEC_FULL.md §10.3. Deliberately narrow: this does not load
//! agent personas, adapter credentials, or anything the Non-goals exclude.
//! Layering follows the `config` crate's builder pattern: defaults, then an
//! optional file, then environment variables prefixed `SERVICE_FABRIC_`.

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue_capacity: usize,
    pub wise_authority_fan_out_cap: usize,
    pub llm_call_timeout_seconds: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pricing_table_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            wise_authority_fan_out_cap: 5,
            llm_call_timeout_seconds: 5,
            circuit_breaker: CircuitBreakerConfig::default(),
            pricing_table_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Loads defaults, then an optional config file at `path`, then
    /// `SERVICE_FABRIC_*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("SERVICE_FABRIC").separator("__"));

        builder.build()?.try_deserialize()
    }
}
