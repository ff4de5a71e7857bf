//! Pipeline configuration
//!
//! Supports loading from TOML files and environment variables.

use meshvault_core::erasure::ErasureConfig;
use meshvault_core::{erasure_config_from_env, MeshVaultError, Result};
use meshvault_core::{DEFAULT_CHUNK_SIZE, FULL_REPLICATION_MAX_MEMBERS, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use meshvault_keys::validate_namespace;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Data shards per stripe (k)
    #[serde(default = "default_data_shards")]
    pub data_shards: usize,

    /// Parity shards per stripe (m)
    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,

    /// Groups up to this size keep full copies instead of erasure stripes
    #[serde(default = "default_full_replication_max_members")]
    pub full_replication_max_members: usize,

    /// Bytes per stripe
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Largest item yielded by a download stream
    #[serde(default = "default_stream_chunk_size")]
    pub stream_chunk_size: usize,

    /// Extra copies of every shard block beyond its placement (0 = none)
    #[serde(default)]
    pub block_replication: usize,

    /// Bound on waiting for a single shard during downloads
    #[serde(default = "default_shard_fetch_timeout_ms")]
    pub shard_fetch_timeout_ms: u64,

    /// Concurrent shard transfers per upload
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Start a healing pass whenever a member fails
    #[serde(default = "default_true")]
    pub auto_heal: bool,

    /// Default bound for `wait_for_healing`
    #[serde(default = "default_heal_timeout_ms")]
    pub heal_timeout_ms: u64,

    /// Interval between periodic checkpoints
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Group whose key protects shards
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_data_shards() -> usize {
    erasure_config_from_env().0
}

fn default_parity_shards() -> usize {
    erasure_config_from_env().1
}

fn default_full_replication_max_members() -> usize {
    FULL_REPLICATION_MAX_MEMBERS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_stream_chunk_size() -> usize {
    1024 * 1024
}

fn default_shard_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrent_transfers() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_heal_timeout_ms() -> u64 {
    60_000
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_group_id() -> String {
    "vault".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
            full_replication_max_members: default_full_replication_max_members(),
            chunk_size: default_chunk_size(),
            stream_chunk_size: default_stream_chunk_size(),
            block_replication: 0,
            shard_fetch_timeout_ms: default_shard_fetch_timeout_ms(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            auto_heal: true,
            heal_timeout_ms: default_heal_timeout_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            group_id: default_group_id(),
            logging: LoggingSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load pipeline config, using defaults");
                Self::default()
            }
        }
    }

    /// Apply environment variable overrides to all settings
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(k) = env_parse("MESHVAULT_DATA_SHARDS") {
            self.data_shards = k;
        }
        if let Some(m) = env_parse("MESHVAULT_PARITY_SHARDS") {
            self.parity_shards = m;
        }
        if let Some(size) = env_parse("MESHVAULT_CHUNK_SIZE") {
            self.chunk_size = size;
        }
        if let Some(n) = env_parse("MESHVAULT_REPLICATION_FACTOR") {
            self.block_replication = n;
        }
        if let Some(ms) = env_parse("MESHVAULT_SHARD_TIMEOUT_MS") {
            self.shard_fetch_timeout_ms = ms;
        }
        if let Some(n) = env_parse("MESHVAULT_MAX_TRANSFERS") {
            self.max_concurrent_transfers = n;
        }
        if let Some(enabled) = env_parse("MESHVAULT_AUTO_HEAL") {
            self.auto_heal = enabled;
        }
        if let Ok(group) = std::env::var("MESHVAULT_GROUP_ID") {
            self.group_id = group;
        }
        if let Ok(level) = std::env::var("MESHVAULT_LOG_LEVEL") {
            self.logging.level = level;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        ErasureConfig::new(self.data_shards, self.parity_shards)?;

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(MeshVaultError::Configuration(format!(
                "chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes"
            )));
        }
        if self.stream_chunk_size == 0 {
            return Err(MeshVaultError::Configuration(
                "stream_chunk_size cannot be 0".to_string(),
            ));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(MeshVaultError::Configuration(
                "max_concurrent_transfers cannot be 0".to_string(),
            ));
        }
        if self.shard_fetch_timeout_ms == 0 || self.heal_timeout_ms == 0 {
            return Err(MeshVaultError::Configuration(
                "timeouts cannot be 0".to_string(),
            ));
        }
        validate_namespace(&self.group_id)
            .map_err(|e| MeshVaultError::Configuration(format!("group_id: {e}")))?;
        Ok(())
    }

    /// Redundancy for a group of `members`
    pub fn erasure_config_for(&self, members: usize) -> Result<ErasureConfig> {
        if members <= self.full_replication_max_members {
            Ok(ErasureConfig::full_replication())
        } else {
            ErasureConfig::new(self.data_shards, self.parity_shards)
        }
    }

    pub fn shard_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_fetch_timeout_ms)
    }

    pub fn heal_timeout(&self) -> Duration {
        Duration::from_millis(self.heal_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.full_replication_max_members, 2);
        assert_eq!(config.block_replication, 0);
        assert!(config.auto_heal);
    }

    #[test]
    fn test_redundancy_selection() {
        let config = PipelineConfig {
            data_shards: 10,
            parity_shards: 6,
            ..PipelineConfig::default()
        };
        assert!(config.erasure_config_for(1).unwrap().is_full_replication());
        assert!(config.erasure_config_for(2).unwrap().is_full_replication());

        let striped = config.erasure_config_for(3).unwrap();
        assert_eq!((striped.data_shards, striped.parity_shards), (10, 6));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_shards = 4").unwrap();
        writeln!(file, "parity_shards = 2").unwrap();
        writeln!(file, "auto_heal = false").unwrap();
        writeln!(file, "[logging]").unwrap();
        writeln!(file, "json = true").unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_shards, 4);
        assert_eq!(config.parity_shards, 2);
        assert!(!config.auto_heal);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_validation_failures() {
        let bad_chunk = PipelineConfig {
            chunk_size: 16,
            ..PipelineConfig::default()
        };
        assert!(bad_chunk.validate().is_err());

        let bad_group = PipelineConfig {
            group_id: "admin".to_string(),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            bad_group.validate(),
            Err(MeshVaultError::Configuration(_))
        ));

        let bad_shards = PipelineConfig {
            parity_shards: 0,
            ..PipelineConfig::default()
        };
        assert!(bad_shards.validate().is_err());
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_shards = \"ten\"").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(file.path()),
            Err(MeshVaultError::Configuration(_))
        ));
        assert_eq!(
            PipelineConfig::load_or_default(file.path()).group_id,
            "vault"
        );
    }
}
