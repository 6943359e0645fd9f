//! Configuration types for the broker.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Broker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen URL: `unix://<path>` or `tcp://<addr>`.
    pub listen: ListenConfig,
    /// Per-connection read/write deadline in seconds; zero disables it.
    pub timeout_secs: u64,
    /// Store configuration.
    pub store: StoreConfig,
}

impl ServerConfig {
    /// Returns the configured per-connection deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Listen address configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ListenConfig {
    /// Listen URL.
    pub url: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            url: "unix:///tmp/cadenced.sock".to_owned(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Driver selection.
    pub driver: DriverKind,
    /// Database path, used by the redb driver.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Memory,
            path: PathBuf::from("cadence.redb"),
        }
    }
}

/// Available store drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Process-local memory store.
    Memory,
    /// Embedded redb store on disk.
    Redb,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.url, "unix:///tmp/cadenced.sock");
        assert_eq!(config.store.driver, DriverKind::Memory);
        assert!(config.deadline().is_none());
    }

    #[test]
    fn deadline_from_secs() {
        let config = ServerConfig {
            timeout_secs: 30,
            ..Default::default()
        };
        assert_eq!(config.deadline(), Some(Duration::from_secs(30)));
    }
}
