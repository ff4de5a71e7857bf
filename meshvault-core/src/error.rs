//! Error types for MeshVault
//!
//! Provides a unified error type for all MeshVault operations.

use thiserror::Error;

/// Result type alias for MeshVault operations
pub type Result<T> = std::result::Result<T, MeshVaultError>;

/// Unified error type for MeshVault
#[derive(Error, Debug)]
pub enum MeshVaultError {
    // ===== Erasure Coding Errors =====
    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Corrupted shard {index}: checksum mismatch")]
    CorruptedShard { index: usize },

    #[error("Shard version mismatch: {0}")]
    VersionMismatch(String),

    #[error("Invalid shard index: {index} (max: {max})")]
    InvalidShardIndex { index: usize, max: usize },

    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Signature verification failed for block {0}")]
    SignatureInvalid(String),

    // ===== Key Management Errors =====
    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Policy error: {0}")]
    Policy(String),

    // ===== Storage Errors =====
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid block ID: {0}")]
    InvalidBlockId(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshVaultError {
    /// Whether this error comes from a failed integrity or authenticity check
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            MeshVaultError::SignatureInvalid(_)
                | MeshVaultError::CorruptedShard { .. }
                | MeshVaultError::Decryption(_)
                | MeshVaultError::VersionMismatch(_)
        )
    }
}

impl From<bincode::Error> for MeshVaultError {
    fn from(err: bincode::Error) -> Self {
        MeshVaultError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MeshVaultError {
    fn from(err: serde_json::Error) -> Self {
        MeshVaultError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MeshVaultError {
    fn from(err: toml::de::Error) -> Self {
        MeshVaultError::Configuration(err.to_string())
    }
}
