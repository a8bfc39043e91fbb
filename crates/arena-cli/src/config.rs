//! File and environment configuration for the `arena` binary.
//!
//! Settings come from a TOML file whose sections mirror the crates they
//! tune. Every field has a default, so a missing file or a partial file is
//! fine. `ARENA_DATABASE` and `ARENA_LOG` override the store path and log
//! level after the file is read.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use arena_store::KvOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Environment variable that overrides [`StoreSection::path`].
pub const DATABASE_ENV: &str = "ARENA_DATABASE";

/// Environment variable that overrides [`LogSection::level`].
pub const LOG_ENV: &str = "ARENA_LOG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub store: StoreSection,
    pub cache: CacheSection,
    pub broker: BrokerSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database file.
    pub path: PathBuf,
    /// Rows fetched per page when listing.
    pub list_batch_size: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/arena.db"),
            list_batch_size: KvOptions::default().list_batch_size,
        }
    }
}

/// Session lookup cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Quiet period before a live view is re-derived after a change.
    pub debounce_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self { debounce_ms: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl ArenaConfig {
    /// Read `path`, falling back to defaults when it does not exist, then
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let parsed = Self::parse(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            debug!(path = %path.display(), "configuration loaded");
            parsed
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(DATABASE_ENV).filter(|p| !p.is_empty()) {
            self.store.path = PathBuf::from(path);
        }
        if let Some(level) = lookup(LOG_ENV).filter(|l| !l.is_empty()) {
            self.log.level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.store.list_batch_size == 0 {
            anyhow::bail!("store.list_batch_size must be at least 1");
        }
        if self.cache.capacity == 0 {
            warn!("cache.capacity is 0, session lookups will always hit the store");
        }
        Ok(())
    }

    pub fn kv_options(&self) -> KvOptions {
        KvOptions {
            list_batch_size: self.store.list_batch_size,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.broker.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = ArenaConfig::parse("").unwrap();
        assert_eq!(config, ArenaConfig::default());
        assert_eq!(config.debounce(), Duration::from_millis(50));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = ArenaConfig::parse(
            r#"
            [store]
            path = "/var/lib/arena/games.db"

            [broker]
            debounce_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/arena/games.db"));
        assert_eq!(config.store.list_batch_size, KvOptions::default().list_batch_size);
        assert_eq!(config.debounce(), Duration::ZERO);
        assert_eq!(config.cache, CacheSection::default());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(ArenaConfig::parse("[store\npath = 1").is_err());
    }

    #[test]
    fn env_overrides_database_path() {
        let mut config = ArenaConfig::default();
        config.apply_env(|name| (name == DATABASE_ENV).then(|| "/tmp/override.db".to_string()));
        assert_eq!(config.store.path, PathBuf::from("/tmp/override.db"));

        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.store.path, PathBuf::from("/tmp/override.db"));
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn env_overrides_log_level() {
        let mut config = ArenaConfig::parse("[log]\nlevel = \"info\"").unwrap();
        assert_eq!(config.log.level, "info");
        config.apply_env(|name| (name == LOG_ENV).then(|| "arena_game=debug".to_string()));
        assert_eq!(config.log.level, "arena_game=debug");
    }

    #[test]
    fn load_reads_file_and_rejects_zero_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.toml");

        std::fs::write(&path, "[cache]\ncapacity = 5\nttl_secs = 1\n").unwrap();
        let config = ArenaConfig::load(&path).unwrap();
        assert_eq!(config.cache.capacity, 5);
        assert_eq!(config.session_ttl(), Duration::from_secs(1));

        std::fs::write(&path, "[store]\nlist_batch_size = 0\n").unwrap();
        assert!(ArenaConfig::load(&path).is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArenaConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cache, CacheSection::default());
    }
}
