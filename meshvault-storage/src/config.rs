//! Content store configuration
//!
//! Loaded from TOML, overridable from the environment:
//!
//! ```toml
//! replication_factor = 3
//! default_policy = "private-scoped:notes"
//! fetch_timeout_ms = 2000
//! capacity_bytes = 0
//! data_dir = "/var/lib/meshvault"
//! locator_difficulty = 8
//! ```

use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::derivation::MAX_POW_DIFFICULTY;
use meshvault_keys::StoragePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod policy_string {
    use meshvault_keys::StoragePolicy;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(policy: &StoragePolicy, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&policy.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StoragePolicy, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Settings of one content store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Extra copies written to the nearest reachable nodes after the local write
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Policy applied when `put` is called without a key
    #[serde(default = "default_policy", with = "policy_string")]
    pub default_policy: StoragePolicy,

    /// Bound on a single remote fetch
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Local backend capacity in bytes (0 = unlimited)
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Persist blocks under this directory instead of memory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Leading zero bits required of private block locators
    #[serde(default = "default_locator_difficulty")]
    pub locator_difficulty: u32,
}

fn default_replication_factor() -> usize {
    3
}

fn default_policy() -> StoragePolicy {
    StoragePolicy::PrivateMax
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_locator_difficulty() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            default_policy: default_policy(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            capacity_bytes: 0,
            data_dir: None,
            locator_difficulty: default_locator_difficulty(),
        }
    }
}

impl StoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StoreConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load store config, using defaults");
                Self::default()
            }
        }
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("MESHVAULT_REPLICATION_FACTOR") {
            self.replication_factor = n;
        }
        if let Some(ms) = env_parse::<u64>("MESHVAULT_FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = ms;
        }
        if let Ok(policy) = std::env::var("MESHVAULT_DEFAULT_POLICY") {
            match policy.parse() {
                Ok(policy) => self.default_policy = policy,
                Err(e) => tracing::warn!(error = %e, "Ignoring MESHVAULT_DEFAULT_POLICY"),
            }
        }
        if let Ok(dir) = std::env::var("MESHVAULT_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.default_policy.validate()?;
        if self.fetch_timeout_ms == 0 {
            return Err(MeshVaultError::Configuration(
                "fetch_timeout_ms cannot be 0".to_string(),
            ));
        }
        if self.locator_difficulty > MAX_POW_DIFFICULTY {
            return Err(MeshVaultError::Configuration(format!(
                "locator_difficulty cannot exceed {MAX_POW_DIFFICULTY}"
            )));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
