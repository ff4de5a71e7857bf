//! MeshVault Core Library
//!
//! Shared building blocks for the MeshVault peer storage layer:
//! - GF(2^8) arithmetic and systematic Reed-Solomon erasure coding
//! - Cryptographic primitives (Blake3 hashing, AES-256-GCM, Argon2)
//! - Ed25519/X25519 participant identities
//! - Content addresses, file chunking and the common error type

pub mod chunk;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod gf256;
pub mod identity;

pub use chunk::{reassemble_chunks, split_into_chunks, BlockId, Chunk};
pub use crypto::{open, seal, ContentHash, EncryptionKey, NonceMode, SealedPayload};
pub use erasure::{ErasureCodec, ErasureConfig, Shard};
pub use error::{MeshVaultError, Result};
pub use identity::{verify_signature, Identity};

/// Default erasure coding configuration
/// - 10 data shards: minimum required to reconstruct
/// - 6 parity shards: any 6 members may fail
///
/// Override at runtime via MESHVAULT_DATA_SHARDS / MESHVAULT_PARITY_SHARDS.
pub const DATA_SHARDS: usize = 10;
pub const PARITY_SHARDS: usize = 6;
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;

/// Groups this small store full copies instead of Reed-Solomon stripes
pub const FULL_REPLICATION_MAX_MEMBERS: usize = 2;

/// Read erasure shard counts from environment, falling back to compile-time defaults.
/// Returns (data_shards, parity_shards, total_shards).
pub fn erasure_config_from_env() -> (usize, usize, usize) {
    let data = std::env::var("MESHVAULT_DATA_SHARDS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DATA_SHARDS);
    let parity = std::env::var("MESHVAULT_PARITY_SHARDS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(PARITY_SHARDS);
    (data, parity, data + parity)
}

/// Chunk size constants
pub const MIN_CHUNK_SIZE: usize = 4 * 1024; // 4 KB
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4 MB
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024; // 64 MB
