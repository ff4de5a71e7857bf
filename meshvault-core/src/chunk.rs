//! Content addresses and file chunking
//!
//! Blocks are addressed by a 32-byte Blake3 digest rendered as hex. Files are
//! split into fixed-size chunks before erasure coding; each chunk becomes one
//! coding stripe.

use crate::crypto::ContentHash;
use crate::error::{MeshVaultError, Result};
use crate::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

const SCOPED_ADDRESS_CONTEXT: &str = "meshvault 2024-06 scoped content address";

/// Content address of a stored block
///
/// Format: 64 lowercase hex characters
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Create a new BlockId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a BlockId from a Blake3 hash
    pub fn from_hash(hash: &ContentHash) -> Self {
        Self(*hash.as_bytes())
    }

    /// Plain Blake3 address of data
    pub fn from_data(data: &[u8]) -> Self {
        Self::from_hash(&ContentHash::compute(data))
    }

    /// Address of plaintext within a dedup scope.
    ///
    /// Identical plaintext in the same scope maps to the same address; the
    /// same plaintext in two scopes never collides.
    pub fn scoped(scope: &str, plaintext: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(SCOPED_ADDRESS_CONTEXT);
        hasher.update(&(scope.len() as u64).to_le_bytes());
        hasher.update(scope.as_bytes());
        if plaintext.len() > 1024 * 1024 {
            hasher.update_rayon(plaintext);
        } else {
            hasher.update(plaintext);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| MeshVaultError::InvalidBlockId(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(MeshVaultError::InvalidBlockId(format!(
                "Invalid length: expected 32, got {}",
                bytes.len()
            )));
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for BlockId {
    type Err = MeshVaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for BlockId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let hex: String = Deserialize::deserialize(deserializer)?;
            return BlockId::from_hex(&hex).map_err(serde::de::Error::custom);
        }
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid block id length"))?;
        Ok(Self(arr))
    }
}

/// One fixed-size piece of a file
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Index within the parent file (for ordered reconstruction)
    pub index: u32,

    /// Total number of chunks in the parent file
    pub total_chunks: u32,

    /// Raw chunk data (a zero-copy slice of the file)
    pub data: Bytes,
}

impl Chunk {
    /// Get the chunk size
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Clamp a requested chunk size to the supported range
pub fn effective_chunk_size(chunk_size: usize) -> usize {
    chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Split a file into chunks without copying
///
/// An empty file yields no chunks.
pub fn split_into_chunks(data: &Bytes, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = effective_chunk_size(chunk_size);
    let total_chunks = data.len().div_ceil(chunk_size);

    (0..total_chunks)
        .map(|index| {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(data.len());
            Chunk {
                index: index as u32,
                total_chunks: total_chunks as u32,
                data: data.slice(start..end),
            }
        })
        .collect()
}

/// Reassemble chunks into original data
pub fn reassemble_chunks(chunks: &[Chunk]) -> Result<Bytes> {
    if chunks.is_empty() {
        return Ok(Bytes::new());
    }

    // Sort by index
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.index);

    // Verify we have all chunks
    let expected_total = sorted[0].total_chunks as usize;
    if sorted.len() != expected_total {
        return Err(MeshVaultError::InsufficientShards {
            available: sorted.len(),
            required: expected_total,
        });
    }

    // Verify indices are contiguous
    for (i, chunk) in sorted.iter().enumerate() {
        if chunk.index != i as u32 {
            return Err(MeshVaultError::InvalidShardIndex {
                index: chunk.index as usize,
                max: expected_total - 1,
            });
        }
    }

    let total_size: usize = sorted.iter().map(|c| c.data.len()).sum();
    let mut result = Vec::with_capacity(total_size);
    for chunk in sorted {
        result.extend_from_slice(&chunk.data);
    }

    Ok(Bytes::from(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_hex_roundtrip() {
        let id = BlockId::from_data(b"hello world");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(BlockId::from_hex(&hex).unwrap(), id);
        assert_eq!(hex.parse::<BlockId>().unwrap(), id);
        assert!(BlockId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_block_id_json_is_hex() {
        let id = BlockId::from_data(b"json");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_scoped_addresses() {
        let a1 = BlockId::scoped("ns:alice", b"same");
        let a2 = BlockId::scoped("ns:alice", b"same");
        let b = BlockId::scoped("ns:bob", b"same");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_ne!(a1, BlockId::from_data(b"same"));
    }

    #[test]
    fn test_split_and_reassemble() {
        let original = Bytes::from(vec![3u8; 1024 * 1024]);
        let chunk_size = 256 * 1024;

        let chunks = split_into_chunks(&original, chunk_size);
        assert_eq!(chunks.len(), 4);

        let reassembled = reassemble_chunks(&chunks).unwrap();
        assert_eq!(reassembled, original);
    }

    #[test]
    fn test_split_uneven_and_empty() {
        let original = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<_>>());
        let chunks = split_into_chunks(&original, MIN_CHUNK_SIZE);
        assert_eq!(chunks.len(), 10_000usize.div_ceil(MIN_CHUNK_SIZE));
        assert_eq!(chunks.last().unwrap().size(), 10_000 % MIN_CHUNK_SIZE);

        assert!(split_into_chunks(&Bytes::new(), MIN_CHUNK_SIZE).is_empty());
        assert!(reassemble_chunks(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_reassemble_missing_chunk() {
        let original = Bytes::from(vec![1u8; 3 * MIN_CHUNK_SIZE]);
        let mut chunks = split_into_chunks(&original, MIN_CHUNK_SIZE);
        chunks.remove(1);
        assert!(matches!(
            reassemble_chunks(&chunks),
            Err(MeshVaultError::InsufficientShards { .. })
        ));
    }
}
