//! Server configuration.

use std::time::Duration;

use livedata_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tunables of the live query machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Period of the unconditional re-poll of polling observers.
    pub polling_interval_ms: u64,
    /// Coalescing window between an invalidation and the re-poll it causes.
    pub polling_throttle_ms: u64,
    /// Delay between attempts after a transient store error.
    pub fetch_retry_delay_ms: u64,
    /// Interval of the "fence still unfired" warning; `None` disables it.
    pub fence_warning_timeout_ms: Option<u64>,
    /// Forces the polling strategy even for stores with an operation log.
    pub disable_oplog: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 10_000,
            polling_throttle_ms: 50,
            fetch_retry_delay_ms: 100,
            fence_warning_timeout_ms: Some(30_000),
            disable_oplog: false,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON configuration; missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::malformed(format!("bad server config: {}", e)))
    }

    #[inline]
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    #[inline]
    pub fn polling_throttle(&self) -> Duration {
        Duration::from_millis(self.polling_throttle_ms)
    }

    #[inline]
    pub fn fetch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms)
    }

    #[inline]
    pub fn fence_warning_timeout(&self) -> Option<Duration> {
        self.fence_warning_timeout_ms.map(Duration::from_millis)
    }
}
