//! Engine configuration.
//!
//! Read from a TOML file. Every field has a default, so a missing file or a
//! partial one is fine; a file that does not parse or holds an impossible
//! value is rejected with `InvalidConfig`.
//!
//! ```toml
//! catalog_path = "data/catalog.toml"
//! data_dir = "data"
//! lock_timeout_ms = 2000
//! max_draws = 1000000
//! rng_seed = 42            # omit for OS entropy
//! log_filter = "info"
//! compact_threshold_bytes = 16777216   # 0 = compact only on request
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EconomyError, EconomyResult};
use crate::loot::DEFAULT_MAX_DRAWS;
use crate::store::DEFAULT_COMPACT_THRESHOLD;

/// File name of the player log inside `data_dir`.
pub const STORE_FILE_NAME: &str = "players.wal";

/// Runtime settings for a [`MiningEngine`](crate::engine::MiningEngine).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Progression catalog to load.
    pub catalog_path: PathBuf,
    /// Directory holding the player log.
    pub data_dir: PathBuf,
    /// Longest wait for a player or index lock.
    pub lock_timeout_ms: u64,
    /// Cap on loot draws per session close.
    pub max_draws: u64,
    /// Fixed seed for loot randomness; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Log size that triggers automatic compaction; zero disables it.
    pub compact_threshold_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("data/catalog.toml"),
            data_dir: PathBuf::from("data"),
            lock_timeout_ms: 2_000,
            max_draws: DEFAULT_MAX_DRAWS,
            rng_seed: None,
            log_filter: "info".to_string(),
            compact_threshold_bytes: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Loads the config file, or the defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::InvalidConfig` if the file cannot be read,
    /// does not parse, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(EconomyError::InvalidConfig(format!("failed to read {}: {e}", path.display())));
            }
        };
        Self::from_toml_str(&text)
    }

    /// Parses and validates a config document.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::InvalidConfig` on parse or validation failure.
    pub fn from_toml_str(text: &str) -> EconomyResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EconomyError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> EconomyResult<()> {
        if self.lock_timeout_ms == 0 {
            return Err(EconomyError::InvalidConfig("lock_timeout_ms must be greater than zero".to_string()));
        }
        if self.max_draws == 0 {
            return Err(EconomyError::InvalidConfig("max_draws must be greater than zero".to_string()));
        }
        if self.catalog_path.as_os_str().is_empty() {
            return Err(EconomyError::InvalidConfig("catalog_path must not be empty".to_string()));
        }
        Ok(())
    }

    /// Lock wait bound as a `Duration`.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Path of the player log.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_draws, 1_000_000);
        assert_eq!(config.compact_threshold_bytes, 16 * 1024 * 1024);
        assert_eq!(config.store_path(), PathBuf::from("data/players.wal"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = EngineConfig::from_toml_str("rng_seed = 7\ndata_dir = \"/var/lib/rockyflow\"\n").unwrap();
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/rockyflow/players.wal"));
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_compaction_can_be_disabled() {
        let config = EngineConfig::from_toml_str("compact_threshold_bytes = 0\n").unwrap();
        assert_eq!(config.compact_threshold_bytes, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = EngineConfig::load("/definitely/not/here/rockyflow.toml").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_rejects_unknown_field() {
        assert!(matches!(
            EngineConfig::from_toml_str("lock_timeout = 5\n"),
            Err(EconomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_draws = 0\n"),
            Err(EconomyError::InvalidConfig(msg)) if msg.contains("max_draws")
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("lock_timeout_ms = 0\n"),
            Err(EconomyError::InvalidConfig(msg)) if msg.contains("lock_timeout_ms")
        ));
    }
}
