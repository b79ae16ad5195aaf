//! Engine configuration
//!
//! Every section has working defaults, so an empty YAML document is a valid
//! configuration. Durations are plain integers with the unit in the key name.
//!
//! ```rust
//! use kartwall::KartwallConfig;
//!
//! let config = KartwallConfig::from_yaml_str(
//!     r#"
//! feed:
//!   url_template: "wss://timing.example.com/live/{circuit}"
//!   max_reconnect_attempts: 5
//! cache:
//!   l1_ttl_secs: 30
//! "#,
//! )
//! .unwrap();
//! assert_eq!(config.feed.url_for("C1"), "wss://timing.example.com/live/C1");
//! assert_eq!(config.stats.window, 10);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{KartwallError, Result};

/// Placeholder substituted with the circuit id in the feed URL template.
pub const CIRCUIT_PLACEHOLDER: &str = "{circuit}";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KartwallConfig {
    pub feed: FeedConfig,
    pub cache: CacheConfig,
    pub stats: StatsConfig,
    pub pagination: PaginationConfig,
    pub storage: StorageConfig,
}

impl KartwallConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| KartwallError::config(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| KartwallError::io_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.feed.url_template.contains(CIRCUIT_PLACEHOLDER) {
            return Err(KartwallError::config(format!(
                "feed.url_template must contain {CIRCUIT_PLACEHOLDER}"
            )));
        }
        if self.feed.keepalive_interval_secs == 0 {
            return Err(KartwallError::config("feed.keepalive_interval_secs must be positive"));
        }
        if self.feed.connect_timeout_secs == 0 {
            return Err(KartwallError::config("feed.connect_timeout_secs must be positive"));
        }
        if self.feed.broadcast_capacity == 0 {
            return Err(KartwallError::config("feed.broadcast_capacity must be positive"));
        }
        let cache = &self.cache;
        if !(cache.l1_ttl_secs > 0 && cache.l1_ttl_secs <= cache.l2_ttl_secs && cache.l2_ttl_secs <= cache.l3_ttl_secs) {
            return Err(KartwallError::config("cache TTLs must be positive and non-decreasing from l1 to l3"));
        }
        if cache.l1_capacity == 0 {
            return Err(KartwallError::config("cache.l1_capacity must be positive"));
        }
        if cache.promote_persistent_after > cache.promote_all_after {
            return Err(KartwallError::config("cache.promote_persistent_after must not exceed promote_all_after"));
        }
        if self.stats.window == 0 || self.stats.fetch_limit < self.stats.window {
            return Err(KartwallError::config("stats.fetch_limit must be at least stats.window (> 0)"));
        }
        if self.stats.refresh_max_wait_ms < self.stats.refresh_debounce_ms {
            return Err(KartwallError::config("stats.refresh_max_wait_ms must be at least refresh_debounce_ms"));
        }
        if self.pagination.page_size == 0 {
            return Err(KartwallError::config("pagination.page_size must be positive"));
        }
        Ok(())
    }
}

/// Timing feed connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    /// Feed URL with `{circuit}` where the circuit id goes.
    pub url_template: String,
    pub keepalive_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Buffered updates per subscriber before the slowest one starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url_template: "wss://timing.example.com/live/{circuit}".to_string(),
            keepalive_interval_secs: 30,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 3,
            max_reconnect_attempts: 5,
            broadcast_capacity: 256,
        }
    }
}

impl FeedConfig {
    /// Feed URL for `circuit_id`, percent-encoded into the template.
    pub fn url_for(&self, circuit_id: &str) -> String {
        self.url_template.replace(CIRCUIT_PLACEHOLDER, &urlencoding::encode(circuit_id))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Tiered cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
    pub l3_ttl_secs: u64,
    pub l1_capacity: usize,
    /// Accesses after which writes go to every tier.
    pub promote_all_after: u64,
    /// Accesses after which writes go to L1 and L2.
    pub promote_persistent_after: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_ttl_secs: 30,
            l2_ttl_secs: 300,
            l3_ttl_secs: 3600,
            l1_capacity: 1024,
            promote_all_after: 10,
            promote_persistent_after: 3,
        }
    }
}

/// Lap statistics settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsConfig {
    /// Laps in the statistics window; also the minimum needed for a result.
    pub window: usize,
    /// Laps fetched from the store to fill the window.
    pub fetch_limit: usize,
    pub refresh_debounce_ms: u64,
    /// Ceiling on how long a refresh can be pushed back by new laps.
    pub refresh_max_wait_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { window: 10, fetch_limit: 15, refresh_debounce_ms: 500, refresh_max_wait_ms: 2500 }
    }
}

impl StatsConfig {
    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn refresh_max_wait(&self) -> Duration {
        Duration::from_millis(self.refresh_max_wait_ms)
    }
}

/// Lap paging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PaginationConfig {
    pub page_size: usize,
    pub prefetch_pages: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self { page_size: 20, prefetch_pages: 2 }
    }
}

/// Where persistent cache tiers live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory for file-backed L2/L3 tiers; in-memory tiers when unset.
    pub cache_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = KartwallConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, KartwallConfig::default());
        assert_eq!(config.feed.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.feed.max_reconnect_attempts, 5);
        assert_eq!(config.cache.l3_ttl_secs, 3600);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = KartwallConfig::from_yaml_str(
            "feed:\n  url_template: ws://localhost:9000/{circuit}\n  reconnect_delay_secs: 1\npagination:\n  page_size: 5\n",
        )
        .unwrap();
        assert_eq!(config.feed.url_for("C1"), "ws://localhost:9000/C1");
        assert_eq!(config.feed.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.feed.connect_timeout_secs, 10);
        assert_eq!(config.pagination.page_size, 5);
        assert_eq!(config.pagination.prefetch_pages, 2);
    }

    #[test]
    fn circuit_ids_are_percent_encoded() {
        let feed = FeedConfig { url_template: "wss://timing.test/live/{circuit}?v=2".to_string(), ..FeedConfig::default() };
        assert_eq!(feed.url_for("Kart Arena/North"), "wss://timing.test/live/Kart%20Arena%2FNorth?v=2");
        assert_eq!(feed.url_for("C1"), "wss://timing.test/live/C1");
    }

    #[test]
    fn rejects_invalid_settings() {
        let cases = [
            "feed:\n  url_template: ws://no-placeholder\n",
            "cache:\n  l1_ttl_secs: 600\n",
            "stats:\n  window: 20\n",
            "pagination:\n  page_size: 0\n",
            "unknown_section: {}\n",
            "feed: [",
        ];
        for yaml in cases {
            let err = KartwallConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, KartwallError::Config { .. }), "{yaml:?} gave {err:?}");
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = KartwallConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, KartwallError::Io { .. }));
    }
}
