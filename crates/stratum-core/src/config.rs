//! Engine tuning, loadable from TOML. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! max_concurrency = 4
//!
//! [retry]
//! max_attempts = 5
//!
//! [readiness]
//! timeout_secs = 600
//!
//! [readiness.kind_timeouts]
//! managed-database = 1800
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::model::Direction;
use crate::readiness::{BackoffPolicy, ReadinessGate};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on concurrently running resource tasks within a batch.
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub timeout_secs: u64,
    pub destroy_timeout_secs: u64,
    /// Per-kind readiness timeout overrides, in seconds.
    pub kind_timeouts: BTreeMap<String, u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            retry: RetryConfig::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2_000,
            multiplier: 2.0,
            max_interval_ms: 30_000,
            timeout_secs: 900,
            destroy_timeout_secs: 900,
            kind_timeouts: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ProvisionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ProvisionError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProvisionError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        for (name, m) in [
            ("retry.multiplier", self.retry.multiplier),
            ("readiness.multiplier", self.readiness.multiplier),
        ] {
            if !m.is_finite() || m < 1.0 {
                return Err(ProvisionError::Config(format!(
                    "{name} must be a finite number >= 1.0, got {m}"
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.retry.initial_delay_ms),
                self.retry.multiplier,
                Duration::from_millis(self.retry.max_delay_ms),
            ),
        }
    }

    /// The gate for resources of `kind` in `direction`. Kind overrides apply
    /// to both directions.
    pub fn readiness_gate(&self, kind: &str, direction: Direction) -> ReadinessGate {
        let r = &self.readiness;
        let default = match direction {
            Direction::Create => r.timeout_secs,
            Direction::Destroy => r.destroy_timeout_secs,
        };
        let timeout = r.kind_timeouts.get(kind).copied().unwrap_or(default);
        ReadinessGate::new(
            BackoffPolicy::new(
                Duration::from_millis(r.initial_interval_ms),
                r.multiplier,
                Duration::from_millis(r.max_interval_ms),
            ),
            Duration::from_secs(timeout),
        )
    }
}
