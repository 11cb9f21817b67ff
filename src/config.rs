//! Engine settings loaded from the environment.

use crate::convergence::backoff::Backoff;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables for caching, retries and convergence polling.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Maximum number of cached team snapshots.
    pub cache_capacity: u64,
    /// How long a cached snapshot is served without a repoll.
    pub cache_freshness: Duration,
    /// Bound of the notification channel feeding the controller.
    pub notify_capacity: usize,
    pub submit_retries: u32,
    pub rotate_retries: u32,
    pub poll_attempts: u32,
    pub poll_base: Duration,
    pub poll_factor: f64,
    pub poll_max: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_freshness: Duration::from_millis(6_000),
            notify_capacity: 256,
            submit_retries: 3,
            rotate_retries: 5,
            poll_attempts: 10,
            poll_base: Duration::from_millis(100),
            poll_factor: 1.5,
            poll_max: Duration::from_millis(5_000),
        }
    }
}

impl EngineSettings {
    /// Read settings from `TEAMCHAIN_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let poll_factor: f64 = var_or("TEAMCHAIN_POLL_FACTOR", "1.5")?;
        if !poll_factor.is_finite() || poll_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                var: "TEAMCHAIN_POLL_FACTOR",
                value: poll_factor.to_string(),
                reason: "must be a finite number no smaller than 1".to_string(),
            });
        }
        Ok(Self {
            cache_capacity: var_or("TEAMCHAIN_CACHE_CAPACITY", "10000")?,
            cache_freshness: Duration::from_millis(var_or(
                "TEAMCHAIN_CACHE_FRESHNESS_MS",
                "6000",
            )?),
            notify_capacity: var_or("TEAMCHAIN_NOTIFY_CAPACITY", "256")?,
            submit_retries: var_or("TEAMCHAIN_SUBMIT_RETRIES", "3")?,
            rotate_retries: var_or("TEAMCHAIN_ROTATE_RETRIES", "5")?,
            poll_attempts: var_or("TEAMCHAIN_POLL_ATTEMPTS", "10")?,
            poll_base: Duration::from_millis(var_or("TEAMCHAIN_POLL_BASE_MS", "100")?),
            poll_factor,
            poll_max: Duration::from_millis(var_or("TEAMCHAIN_POLL_MAX_MS", "5000")?),
        })
    }

    /// Backoff policy for convergence polling.
    pub fn poll_backoff(&self) -> Backoff {
        Backoff::new(self.poll_base, self.poll_max, self.poll_factor)
    }
}

fn var_or<T>(var: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = env::var(var).unwrap_or_else(|_| default.to_string());
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: value.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_poll_backoff() {
        let settings = EngineSettings::default();
        let mut backoff = settings.poll_backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(150));
        assert_eq!(backoff.next_delay(), Duration::from_millis(225));
    }
}
