//! Block backend trait
//!
//! Backends persist serialized blocks by content address. A `put` is one
//! atomic insert: readers see either no block or the complete block.

use bytes::Bytes;
use meshvault_core::chunk::BlockId;
use meshvault_core::error::Result;

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Total number of blocks stored
    pub block_count: u64,

    /// Total bytes used by blocks
    pub bytes_used: u64,

    /// Total storage capacity (0 = unlimited)
    pub bytes_capacity: u64,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations
    pub writes: u64,

    /// Number of delete operations
    pub deletes: u64,
}

impl StorageStats {
    /// Calculate usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.bytes_capacity == 0 {
            0.0
        } else {
            (self.bytes_used as f64 / self.bytes_capacity as f64) * 100.0
        }
    }

    /// Check if storage is full
    pub fn is_full(&self) -> bool {
        self.bytes_capacity > 0 && self.bytes_used >= self.bytes_capacity
    }

    /// Available space in bytes
    pub fn bytes_available(&self) -> u64 {
        if self.bytes_capacity == 0 {
            u64::MAX
        } else {
            self.bytes_capacity.saturating_sub(self.bytes_used)
        }
    }
}

/// Synchronous block backend
///
/// Calls never block for long and are safe to make from async code as long
/// as no lock is held across an `.await`.
pub trait BlockBackend: Send + Sync {
    /// Store a block, returning `false` if the address was already present
    fn put(&self, id: BlockId, data: Bytes) -> Result<bool>;

    /// Retrieve a block
    fn get(&self, id: &BlockId) -> Result<Option<Bytes>>;

    /// Delete a block
    fn delete(&self, id: &BlockId) -> Result<bool>;

    /// Check if a block exists
    fn exists(&self, id: &BlockId) -> Result<bool>;

    /// Get storage statistics
    fn stats(&self) -> Result<StorageStats>;

    /// List all block IDs
    fn list_blocks(&self) -> Result<Vec<BlockId>>;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}
