//! Engine tunables.

use std::time::Duration;

/// Environment variable overriding [`EngineConfig::cleanup_delay`] (milliseconds).
pub const ENV_CLEANUP_DELAY_MS: &str = "LAYER_UPDATES_CLEANUP_DELAY_MS";
/// Environment variable overriding [`EngineConfig::watchdog_threshold`] (milliseconds).
pub const ENV_WATCHDOG_MS: &str = "LAYER_UPDATES_WATCHDOG_MS";

/// Configuration for [`crate::EngineBuilder::config`].
///
/// ```rust
/// use std::time::Duration;
/// use layer_updates::EngineConfig;
///
/// let cfg = EngineConfig::default()
///     .cleanup_delay(Duration::from_millis(500))
///     .watchdog_threshold(Duration::from_secs(10));
/// assert_eq!(cfg.watchdog_threshold, Duration::from_secs(10));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// How long a settled fetch stays registered before a new trigger may
    /// start a fresh one (default: 1000 ms).
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub cleanup_delay: Duration,
    /// After how long a queued task logs a "handle too long" warning
    /// (default: 30000 ms).  Never cancels the task.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub watchdog_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cleanup_delay:      Duration::from_millis(1000),
            watchdog_threshold: Duration::from_millis(30_000),
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by [`ENV_CLEANUP_DELAY_MS`] / [`ENV_WATCHDOG_MS`]
    /// when set to a valid number of milliseconds.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = env_millis(ENV_CLEANUP_DELAY_MS) {
            cfg.cleanup_delay = ms;
        }
        if let Some(ms) = env_millis(ENV_WATCHDOG_MS) {
            cfg.watchdog_threshold = ms;
        }
        cfg
    }

    /// Set the in-flight cleanup cooldown.
    pub fn cleanup_delay(mut self, d: Duration) -> Self {
        self.cleanup_delay = d; self
    }

    /// Set the watchdog threshold.
    pub fn watchdog_threshold(mut self, d: Duration) -> Self {
        self.watchdog_threshold = d; self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::debug!("[layer-updates] ignoring {key}={raw:?}: not a millisecond count");
            None
        }
    }
}

#[cfg(feature = "serde")]
mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
