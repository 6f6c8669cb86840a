//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Configuration for a [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live connections (idle + borrowed).
    pub max_size: usize,
    /// Maximum time `borrow()` waits for capacity.
    pub borrow_timeout: Duration,
    /// Validate idle connections before handing them out.
    pub validate_on_borrow: bool,
    /// Validate connections when they are returned.
    pub validate_on_return: bool,
    /// Idle connections older than this are destroyed by `evict_idle()`.
    pub max_idle: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            borrow_timeout: Duration::from_secs(30),
            validate_on_borrow: true,
            validate_on_return: true,
            max_idle: None,
        }
    }
}

impl PoolConfig {
    /// Create a config with the given size and defaults for everything else.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Reject configurations the pool cannot honour.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.borrow_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("borrow_timeout must be non-zero".into()));
        }
        if self.max_idle.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::InvalidConfig("max_idle must be non-zero when set".into()));
        }
        Ok(())
    }
}

/// Serializable form of [`PoolConfig`] with millisecond durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_borrow_timeout_ms")]
    pub borrow_timeout_ms: u64,
    #[serde(default = "bool_true")]
    pub validate_on_borrow: bool,
    #[serde(default = "bool_true")]
    pub validate_on_return: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_ms: Option<u64>,
}

fn default_max_size() -> usize { 8 }
fn default_borrow_timeout_ms() -> u64 { 30_000 }
fn bool_true() -> bool { true }

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            borrow_timeout_ms: default_borrow_timeout_ms(),
            validate_on_borrow: true,
            validate_on_return: true,
            max_idle_ms: None,
        }
    }
}

impl PoolSettings {
    /// Parse settings from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, PoolError> {
        serde_json::from_str(json).map_err(|e| PoolError::InvalidConfig(e.to_string()))
    }
}

impl TryFrom<PoolSettings> for PoolConfig {
    type Error = PoolError;

    fn try_from(s: PoolSettings) -> Result<Self, Self::Error> {
        let config = PoolConfig {
            max_size: s.max_size,
            borrow_timeout: Duration::from_millis(s.borrow_timeout_ms),
            validate_on_borrow: s.validate_on_borrow,
            validate_on_return: s.validate_on_return,
            max_idle: s.max_idle_ms.map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(c: &PoolConfig) -> Self {
        Self {
            max_size: c.max_size,
            borrow_timeout_ms: c.borrow_timeout.as_millis() as u64,
            validate_on_borrow: c.validate_on_borrow,
            validate_on_return: c.validate_on_return,
            max_idle_ms: c.max_idle.map(|d| d.as_millis() as u64),
        }
    }
}
