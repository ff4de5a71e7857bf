//! File manifests
//!
//! A manifest records where every shard of one file version lives. Manifests
//! are never edited: a content update commits a new `version`, a relocation
//! by healing commits a new `revision` of the same version.

use chrono::{DateTime, Utc};
use meshvault_core::chunk::BlockId;
use meshvault_core::crypto::ContentHash;
use meshvault_core::erasure::ErasureConfig;
use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::StoragePolicy;
use meshvault_storage::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// First version of every file
pub const INITIAL_VERSION: &str = "1.0.0";

/// Bump the patch component of a `major.minor.patch` version
pub fn next_patch_version(version: &str) -> Result<String> {
    let parts: Vec<&str> = version.split('.').collect();
    let parsed: Option<Vec<u64>> = parts.iter().map(|p| p.parse().ok()).collect();
    match parsed.as_deref() {
        Some([major, minor, patch]) => {
            let next = patch.checked_add(1).ok_or_else(|| {
                MeshVaultError::VersionMismatch(format!("patch version of {version} is exhausted"))
            })?;
            Ok(format!("{major}.{minor}.{next}"))
        }
        _ => Err(MeshVaultError::VersionMismatch(format!(
            "invalid version {version:?}"
        ))),
    }
}

/// How a file's stripes are protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyMode {
    FullReplication,
    ErasureCoded,
}

/// Redundancy parameters recorded with a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redundancy {
    pub mode: RedundancyMode,
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl Redundancy {
    pub fn from_config(config: &ErasureConfig) -> Self {
        Self {
            mode: if config.is_full_replication() {
                RedundancyMode::FullReplication
            } else {
                RedundancyMode::ErasureCoded
            },
            data_shards: config.data_shards,
            parity_shards: config.parity_shards,
        }
    }

    pub fn erasure_config(&self) -> Result<ErasureConfig> {
        ErasureConfig::new(self.data_shards, self.parity_shards)
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

/// Where one shard is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardLocation {
    pub shard_id: String,
    pub shard_index: usize,
    pub chunk_index: u32,
    pub node_id: NodeId,
    pub block_id: BlockId,
    pub member_id: String,
}

/// One erasure-coded chunk of the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeInfo {
    pub chunk_index: u32,
    pub size: u64,
    pub checksum: ContentHash,
}

/// One committed version of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_id: String,
    pub file_name: String,
    pub shard_locations: Vec<ShardLocation>,
    /// Blake3 of the whole file
    pub checksum: ContentHash,
    pub size: u64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    /// Bumped each time healing relocates shards of this version
    #[serde(default)]
    pub revision: u32,
    pub policy: StoragePolicy,
    pub redundancy: Redundancy,
    pub chunk_size: usize,
    pub stripes: Vec<StripeInfo>,
    /// Member that uploaded this version
    pub uploader: String,
}

impl Manifest {
    /// Locations of one stripe, ordered by shard index
    pub fn locations_for(&self, chunk_index: u32) -> Vec<&ShardLocation> {
        let mut locations: Vec<&ShardLocation> = self
            .shard_locations
            .iter()
            .filter(|loc| loc.chunk_index == chunk_index)
            .collect();
        locations.sort_by_key(|loc| loc.shard_index);
        locations
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Append-only manifest log
#[derive(Default)]
pub struct ManifestStore {
    files: RwLock<HashMap<String, Vec<Manifest>>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new version; it must not repeat an existing one
    pub fn commit(&self, manifest: Manifest) -> Result<()> {
        let mut files = self.files.write();
        let history = files.entry(manifest.file_id.clone()).or_default();
        if history
            .iter()
            .any(|m| m.version == manifest.version && m.revision == manifest.revision)
        {
            return Err(MeshVaultError::VersionMismatch(format!(
                "{} v{} r{} is already committed",
                manifest.file_id, manifest.version, manifest.revision
            )));
        }

        info!(
            file_id = %manifest.file_id,
            version = %manifest.version,
            revision = manifest.revision,
            shards = manifest.shard_locations.len(),
            "Committed manifest"
        );
        history.push(manifest);
        Ok(())
    }

    /// Append a new revision only if `expected_version`/`expected_revision`
    /// is still the latest entry. Returns whether it was committed.
    pub fn commit_if_latest(
        &self,
        expected_version: &str,
        expected_revision: u32,
        manifest: Manifest,
    ) -> bool {
        let mut files = self.files.write();
        let Some(history) = files.get_mut(&manifest.file_id) else {
            return false;
        };
        let current = history
            .last()
            .map(|m| (m.version.as_str(), m.revision));
        if current != Some((expected_version, expected_revision)) {
            debug!(file_id = %manifest.file_id, "Manifest moved on, dropping revision");
            return false;
        }
        history.push(manifest);
        true
    }

    pub fn latest(&self, file_id: &str) -> Result<Manifest> {
        self.files
            .read()
            .get(file_id)
            .and_then(|h| h.last().cloned())
            .ok_or_else(|| MeshVaultError::NotFound(format!("file {file_id}")))
    }

    /// Every committed entry, oldest first
    pub fn history(&self, file_id: &str) -> Vec<Manifest> {
        self.files.read().get(file_id).cloned().unwrap_or_default()
    }

    /// Latest manifest of the most recently created file with this name
    pub fn find_by_name(&self, file_name: &str) -> Option<Manifest> {
        self.files
            .read()
            .values()
            .filter_map(|h| h.last())
            .filter(|m| m.file_name == file_name)
            .max_by_key(|m| m.created_at)
            .cloned()
    }

    /// Latest manifest of every file
    pub fn all_latest(&self) -> Vec<Manifest> {
        let mut latest: Vec<Manifest> = self
            .files
            .read()
            .values()
            .filter_map(|h| h.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        latest
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}
