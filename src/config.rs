use std::time::Duration;
use thiserror::Error;

/// overrides the flush interval of the event bus, in milliseconds
pub const FLUSH_MS_VAR: &str = "SOCIAL_STATE_FLUSH_MS";

/// overrides how many undelivered notifications a slow subscriber may fall behind
pub const CHANNEL_CAPACITY_VAR: &str = "SOCIAL_STATE_CHANNEL_CAPACITY";

/// Tunables of a [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// how long the event bus coalesces emissions before notifying
    pub flush_interval: Duration,
    /// per-event broadcast channel capacity
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            flush_interval: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }
}

/// returned Error for unusable configuration values
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl Config {
    /// the defaults, overridden by whichever environment variables are set
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(ms) = positive(FLUSH_MS_VAR, lookup(FLUSH_MS_VAR))? {
            config.flush_interval = Duration::from_millis(ms as u64);
        }
        if let Some(capacity) = positive(CHANNEL_CAPACITY_VAR, lookup(CHANNEL_CAPACITY_VAR))? {
            config.channel_capacity = capacity;
        }
        Ok(config)
    }
}

fn positive(var: &'static str, value: Option<String>) -> Result<Option<usize>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}
