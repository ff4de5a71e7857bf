//! Reed-Solomon Erasure Coding
//!
//! Implements systematic (k, m) erasure coding over GF(2^8):
//! - k data shards are the padded payload split in equal parts
//! - m parity shards come from a Vandermonde-derived coding matrix
//! - ANY k valid shards reconstruct the payload
//!
//! The coding matrix is `V * inverse(V_top)` where `V` is the
//! `(k + m) x k` Vandermonde matrix and `V_top` its first k rows, so the first
//! k rows are the identity and every k-row subset stays invertible.
//!
//! `(k = 1, m = 1)` is full replication: both shards are verbatim copies and
//! no field arithmetic runs.

use crate::crypto::ContentHash;
use crate::error::{MeshVaultError, Result};
use crate::gf256::{self, Matrix};
use crate::{DATA_SHARDS, PARITY_SHARDS};
use bytes::Bytes;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Largest shard count addressable with GF(2^8) Vandermonde rows
pub const MAX_TOTAL_SHARDS: usize = 256;

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            data_shards: DATA_SHARDS,
            parity_shards: PARITY_SHARDS,
        }
    }
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(MeshVaultError::Configuration(
                "data_shards must be > 0".to_string(),
            ));
        }
        if parity_shards == 0 {
            return Err(MeshVaultError::Configuration(
                "parity_shards must be > 0".to_string(),
            ));
        }
        if data_shards + parity_shards > MAX_TOTAL_SHARDS {
            return Err(MeshVaultError::Configuration(format!(
                "data_shards + parity_shards must be <= {MAX_TOTAL_SHARDS}"
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// One data shard plus one verbatim copy
    pub fn full_replication() -> Self {
        Self {
            data_shards: 1,
            parity_shards: 1,
        }
    }

    /// Whether shards are plain copies of the payload
    pub fn is_full_replication(&self) -> bool {
        self.data_shards == 1
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Storage overhead ratio (parity/data)
    pub fn overhead_ratio(&self) -> f64 {
        self.parity_shards as f64 / self.data_shards as f64
    }

    /// Maximum number of failures that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }

    /// Size of each shard for a payload of `data_size` bytes
    pub fn shard_size(&self, data_size: usize) -> usize {
        data_size.div_ceil(self.data_shards)
    }
}

/// A single shard of erasure-coded data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Stable identifier: stripe checksum prefix plus index
    pub id: String,
    /// Shard payload
    pub data: Bytes,
    /// Shard index (0 to total_shards-1)
    pub shard_index: usize,
    /// k + m of the encoding that produced this shard
    pub total_shards: usize,
    /// k of the encoding that produced this shard
    pub data_shards: usize,
    /// Whether this is a parity shard
    pub is_parity: bool,
    /// Blake3 of `data`
    pub checksum: ContentHash,
    /// Length of the encoded payload before padding
    pub original_size: u64,
    /// Blake3 of the encoded payload
    pub stripe_checksum: ContentHash,
}

impl Shard {
    /// Get shard size
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload still matches its checksum
    pub fn verify(&self) -> bool {
        self.checksum.verify(&self.data)
    }

    /// Like [`Shard::verify`] but surfaces [`MeshVaultError::CorruptedShard`]
    pub fn ensure_valid(&self) -> Result<()> {
        if self.verify() {
            Ok(())
        } else {
            Err(MeshVaultError::CorruptedShard {
                index: self.shard_index,
            })
        }
    }

    /// Serialize to the binary envelope stored inside blocks
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a binary envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn same_source(&self, other: &Shard) -> bool {
        self.original_size == other.original_size
            && self.stripe_checksum == other.stripe_checksum
            && self.data_shards == other.data_shards
            && self.total_shards == other.total_shards
            && self.data.len() == other.data.len()
    }
}

/// Reed-Solomon encoder/decoder
pub struct ErasureCodec {
    config: ErasureConfig,
    /// `(k + m) x k` systematic coding matrix
    matrix: Matrix,
}

impl ErasureCodec {
    /// Create a codec with the default configuration (10, 6)
    pub fn new() -> Result<Self> {
        Self::with_config(ErasureConfig::default())
    }

    /// Create a codec with custom configuration
    pub fn with_config(config: ErasureConfig) -> Result<Self> {
        let config = ErasureConfig::new(config.data_shards, config.parity_shards)?;
        let k = config.data_shards;

        let vandermonde = Matrix::vandermonde(config.total_shards(), k);
        let top_inverse = vandermonde
            .top_left(k, k)
            .invert()
            .ok_or_else(|| MeshVaultError::Internal("Vandermonde top block is singular".into()))?;
        let matrix = vandermonde
            .multiply(&top_inverse)
            .ok_or_else(|| MeshVaultError::Internal("coding matrix dimensions".into()))?;

        Ok(Self { config, matrix })
    }

    /// Get the erasure configuration
    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Encode data into `k + m` shards
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Shard>> {
        let k = self.config.data_shards;
        let total = self.config.total_shards();
        let shard_size = self.config.shard_size(data.len());
        let stripe_checksum = ContentHash::compute(data);

        // Pad data to be evenly divisible by data_shards
        let mut padded = Vec::with_capacity(shard_size * k);
        padded.extend_from_slice(data);
        padded.resize(shard_size * k, 0);
        let padded = Bytes::from(padded);

        let data_parts: Vec<Bytes> = (0..k)
            .map(|i| padded.slice(i * shard_size..(i + 1) * shard_size))
            .collect();

        let parity_parts: Vec<Bytes> = if self.config.is_full_replication() {
            vec![data_parts[0].clone(); self.config.parity_shards]
        } else {
            (k..total)
                .into_par_iter()
                .map(|row| {
                    let mut out = vec![0u8; shard_size];
                    for (col, part) in data_parts.iter().enumerate() {
                        gf256::mul_add_slice(self.matrix.get(row, col), part, &mut out);
                    }
                    Bytes::from(out)
                })
                .collect()
        };

        let id_prefix = &stripe_checksum.to_hex()[..16];
        let shards: Vec<Shard> = data_parts
            .into_iter()
            .chain(parity_parts)
            .enumerate()
            .map(|(index, part)| Shard {
                id: format!("{id_prefix}-{index:03}"),
                checksum: ContentHash::compute(&part),
                data: part,
                shard_index: index,
                total_shards: total,
                data_shards: k,
                is_parity: index >= k,
                original_size: data.len() as u64,
                stripe_checksum,
            })
            .collect();

        debug!(
            size = data.len(),
            shard_size,
            data_shards = k,
            parity_shards = self.config.parity_shards,
            "Encoded stripe"
        );

        Ok(shards)
    }

    /// Decode any subset of shards back into the original data
    ///
    /// Shards failing their checksum are skipped. Fewer than k valid distinct
    /// shards is [`MeshVaultError::InsufficientShards`]; valid shards from
    /// different encodings is [`MeshVaultError::VersionMismatch`].
    pub fn decode(&self, shards: &[Shard]) -> Result<Bytes> {
        let k = self.config.data_shards;
        let valid = self.collect_valid(shards)?;

        if valid.len() < k {
            return Err(MeshVaultError::InsufficientShards {
                available: valid.len(),
                required: k,
            });
        }

        let reference = valid.values().next().copied().ok_or(MeshVaultError::InsufficientShards {
            available: 0,
            required: k,
        })?;
        let original_size = reference.original_size as usize;
        let shard_size = reference.size();

        if shard_size != self.config.shard_size(original_size) {
            return Err(MeshVaultError::VersionMismatch(format!(
                "shard size {} does not fit payload of {} bytes",
                shard_size, original_size
            )));
        }

        let data_parts = if self.config.is_full_replication() {
            vec![reference.data.clone()]
        } else {
            self.reconstruct_data_parts(&valid, shard_size)?
        };

        let mut result = Vec::with_capacity(shard_size * k);
        for part in &data_parts {
            result.extend_from_slice(part);
        }
        result.truncate(original_size);

        if !reference.stripe_checksum.verify(&result) {
            return Err(MeshVaultError::VersionMismatch(
                "reconstructed payload does not match stripe checksum".to_string(),
            ));
        }

        Ok(Bytes::from(result))
    }

    /// Regenerate specific shard indices from any k valid shards
    pub fn reconstruct_shards(&self, shards: &[Shard], wanted: &[usize]) -> Result<Vec<Shard>> {
        let total = self.config.total_shards();
        if let Some(&bad) = wanted.iter().find(|&&i| i >= total) {
            return Err(MeshVaultError::InvalidShardIndex {
                index: bad,
                max: total - 1,
            });
        }

        let payload = self.decode(shards)?;
        let mut encoded = self.encode(&payload)?;
        let mut out = Vec::with_capacity(wanted.len());
        for &index in wanted {
            out.push(std::mem::replace(
                &mut encoded[index],
                placeholder_shard(index),
            ));
        }
        Ok(out)
    }

    /// Verify that a full shard set is self-consistent (for health checking)
    pub fn verify_shards(&self, shards: &[Shard]) -> Result<bool> {
        let total = self.config.total_shards();
        if shards.len() != total {
            return Ok(false);
        }

        let mut ordered: Vec<&Shard> = shards.iter().collect();
        ordered.sort_by_key(|s| s.shard_index);

        let expected_size = ordered[0].size();
        for (i, shard) in ordered.iter().enumerate() {
            if shard.shard_index != i || shard.size() != expected_size || !shard.verify() {
                return Ok(false);
            }
        }

        let k = self.config.data_shards;
        for row in k..total {
            let mut expected = vec![0u8; expected_size];
            if self.config.is_full_replication() {
                expected.copy_from_slice(&ordered[0].data);
            } else {
                for (col, shard) in ordered.iter().take(k).enumerate() {
                    gf256::mul_add_slice(self.matrix.get(row, col), &shard.data, &mut expected);
                }
            }
            if expected.as_slice() != ordered[row].data.as_ref() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Valid shards keyed by index, rejecting mixed encodings
    fn collect_valid<'a>(&self, shards: &'a [Shard]) -> Result<BTreeMap<usize, &'a Shard>> {
        let total = self.config.total_shards();
        let mut valid: BTreeMap<usize, &Shard> = BTreeMap::new();

        for shard in shards {
            if shard.shard_index >= total {
                return Err(MeshVaultError::InvalidShardIndex {
                    index: shard.shard_index,
                    max: total - 1,
                });
            }
            if !shard.verify() {
                warn!(
                    shard_index = shard.shard_index,
                    shard_id = %shard.id,
                    "Skipping shard with checksum mismatch"
                );
                continue;
            }
            if shard.data_shards != self.config.data_shards || shard.total_shards != total {
                return Err(MeshVaultError::VersionMismatch(format!(
                    "shard {} was encoded as ({}, {}), codec is ({}, {})",
                    shard.shard_index,
                    shard.data_shards,
                    shard.total_shards - shard.data_shards,
                    self.config.data_shards,
                    self.config.parity_shards
                )));
            }
            if let Some(first) = valid.values().next() {
                if !first.same_source(shard) {
                    return Err(MeshVaultError::VersionMismatch(format!(
                        "shard {} belongs to a different payload than shard {}",
                        shard.shard_index, first.shard_index
                    )));
                }
            }
            valid.entry(shard.shard_index).or_insert(shard);
        }

        Ok(valid)
    }

    /// Rebuild the k data parts, solving for missing ones
    fn reconstruct_data_parts(
        &self,
        valid: &BTreeMap<usize, &Shard>,
        shard_size: usize,
    ) -> Result<Vec<Bytes>> {
        let k = self.config.data_shards;

        // BTreeMap order puts data shards first
        let chosen: Vec<&Shard> = valid.values().take(k).copied().collect();
        if chosen.iter().all(|s| s.shard_index < k) {
            return Ok(chosen.iter().map(|s| s.data.clone()).collect());
        }

        let rows: Vec<usize> = chosen.iter().map(|s| s.shard_index).collect();
        let decode_matrix = self
            .matrix
            .select_rows(&rows)
            .invert()
            .ok_or_else(|| MeshVaultError::Internal("decode matrix is singular".to_string()))?;

        let rebuilt: Vec<Bytes> = (0..k)
            .into_par_iter()
            .map(|target| {
                if let Some(shard) = valid.get(&target) {
                    return shard.data.clone();
                }
                let mut out = vec![0u8; shard_size];
                for (col, shard) in chosen.iter().enumerate() {
                    gf256::mul_add_slice(decode_matrix.get(target, col), &shard.data, &mut out);
                }
                Bytes::from(out)
            })
            .collect();

        debug!(
            missing = k - chosen.iter().filter(|s| s.shard_index < k).count(),
            "Reconstructed missing data shards"
        );

        Ok(rebuilt)
    }
}

fn placeholder_shard(index: usize) -> Shard {
    let empty = ContentHash::compute(&[]);
    Shard {
        id: String::new(),
        data: Bytes::new(),
        shard_index: index,
        total_shards: 0,
        data_shards: 0,
        is_parity: false,
        checksum: empty,
        original_size: 0,
        stripe_checksum: empty,
    }
}
