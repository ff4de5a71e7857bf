//! In-memory block backend
//!
//! Backs every simulated node. Not persistent.

use crate::backend::{BlockBackend, StorageStats};
use bytes::Bytes;
use meshvault_core::chunk::BlockId;
use meshvault_core::error::{MeshVaultError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory block backend
#[derive(Default)]
pub struct MemoryBackend {
    blocks: RwLock<HashMap<BlockId, Bytes>>,

    /// Maximum capacity (0 = unlimited)
    max_capacity: u64,

    bytes_used: AtomicU64,

    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a maximum capacity
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            max_capacity: max_bytes,
            ..Self::default()
        }
    }

    /// Clear all stored blocks
    pub fn clear(&self) {
        let mut blocks = self.blocks.write();
        blocks.clear();
        self.bytes_used.store(0, Ordering::SeqCst);
    }
}

impl BlockBackend for MemoryBackend {
    fn put(&self, id: BlockId, data: Bytes) -> Result<bool> {
        let data_len = data.len() as u64;
        let mut blocks = self.blocks.write();

        // Content addressed: an existing block is never replaced
        if blocks.contains_key(&id) {
            return Ok(false);
        }

        if self.max_capacity > 0 {
            let current = self.bytes_used.load(Ordering::SeqCst);
            if current + data_len > self.max_capacity {
                return Err(MeshVaultError::Storage(format!(
                    "backend full: {current} of {} bytes used",
                    self.max_capacity
                )));
            }
        }

        blocks.insert(id, data);
        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn get(&self, id: &BlockId) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.blocks.read().get(id).cloned())
    }

    fn delete(&self, id: &BlockId) -> Result<bool> {
        let mut blocks = self.blocks.write();
        match blocks.remove(id) {
            Some(old) => {
                self.bytes_used.fetch_sub(old.len() as u64, Ordering::SeqCst);
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        Ok(self.blocks.read().contains_key(id))
    }

    fn stats(&self) -> Result<StorageStats> {
        let blocks = self.blocks.read();
        Ok(StorageStats {
            block_count: blocks.len() as u64,
            bytes_used: self.bytes_used.load(Ordering::SeqCst),
            bytes_capacity: self.max_capacity,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }

    fn list_blocks(&self) -> Result<Vec<BlockId>> {
        Ok(self.blocks.read().keys().copied().collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
