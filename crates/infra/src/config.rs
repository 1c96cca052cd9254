//! Transport configuration read from the environment.
//!
//! | variable                | default                  |
//! |-------------------------|--------------------------|
//! | `REDIS_URL`             | `redis://localhost:6379` |
//! | `RFX_RECONNECT_BASE_MS` | `1000`                   |
//! | `RFX_RECONNECT_MAX_MS`  | `30000`                  |

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

pub const REDIS_URL_VAR: &str = "REDIS_URL";
pub const RECONNECT_BASE_VAR: &str = "RFX_RECONNECT_BASE_MS";
pub const RECONNECT_MAX_VAR: &str = "RFX_RECONNECT_MAX_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Exponential backoff for long-running reads after a connection failure.
///
/// The first retry waits `base_delay`, each following one twice as long,
/// capped at `max_delay`. A successful read resets the delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub redis_url: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ReconnectPolicy::default();
        let base_delay = millis(&lookup, RECONNECT_BASE_VAR)?.unwrap_or(defaults.base_delay);
        let max_delay = millis(&lookup, RECONNECT_MAX_VAR)?.unwrap_or(defaults.max_delay);
        if max_delay < base_delay {
            return Err(ConfigError::Invalid {
                var: RECONNECT_MAX_VAR,
                value: max_delay.as_millis().to_string(),
                reason: format!("below {RECONNECT_BASE_VAR}"),
            });
        }

        Ok(Self {
            redis_url: lookup(REDIS_URL_VAR)
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            reconnect: ReconnectPolicy {
                base_delay,
                max_delay,
            },
        })
    }
}

fn millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be positive".to_string(),
        }),
        Ok(ms) => Ok(Some(Duration::from_millis(ms))),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
