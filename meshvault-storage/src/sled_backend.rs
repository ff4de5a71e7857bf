//! Sled block backend
//!
//! Persistent blocks in one sled tree keyed by the 32-byte block address.
//! Sled is pure Rust and its `compare_and_swap` gives the backend an atomic
//! insert-if-absent, so concurrent writers of the same block agree on which
//! one stored it.

use crate::backend::{BlockBackend, StorageStats};
use bytes::Bytes;
use meshvault_core::chunk::BlockId;
use meshvault_core::error::{MeshVaultError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const BLOCKS_TREE: &str = "blocks";

fn storage_error(e: sled::Error) -> MeshVaultError {
    MeshVaultError::Storage(e.to_string())
}

/// Sled-backed persistent block storage
pub struct SledBackend {
    db: sled::Db,
    blocks: sled::Tree,
    path: Option<PathBuf>,
    max_capacity: u64,

    bytes_used: AtomicU64,
    block_count: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl SledBackend {
    /// Open or create a block database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_capacity(path, 0)
    }

    pub fn open_with_capacity<P: AsRef<Path>>(path: P, max_capacity: u64) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled block store");
        let db = sled::open(path.as_ref())
            .map_err(|e| MeshVaultError::Storage(format!("Failed to open Sled: {e}")))?;
        Self::from_db(db, Some(path.as_ref().to_path_buf()), max_capacity)
    }

    /// Open a store that is removed on drop (for testing)
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| MeshVaultError::Storage(format!("Failed to open Sled: {e}")))?;
        Self::from_db(db, None, 0)
    }

    fn from_db(db: sled::Db, path: Option<PathBuf>, max_capacity: u64) -> Result<Self> {
        let blocks = db.open_tree(BLOCKS_TREE).map_err(storage_error)?;

        let mut bytes = 0u64;
        let mut count = 0u64;
        for item in blocks.iter() {
            let (_, value) = item.map_err(storage_error)?;
            bytes += value.len() as u64;
            count += 1;
        }
        debug!(blocks = count, bytes, "Scanned block tree");

        Ok(Self {
            db,
            blocks,
            path,
            max_capacity,
            bytes_used: AtomicU64::new(bytes),
            block_count: AtomicU64::new(count),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Database directory, `None` for temporary stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get database size estimate
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl BlockBackend for SledBackend {
    fn put(&self, id: BlockId, data: Bytes) -> Result<bool> {
        let data_len = data.len() as u64;
        if self.max_capacity > 0 {
            let current = self.bytes_used.load(Ordering::SeqCst);
            if current + data_len > self.max_capacity {
                return Err(MeshVaultError::Storage(format!(
                    "backend full: {current} of {} bytes used",
                    self.max_capacity
                )));
            }
        }

        let swapped = self
            .blocks
            .compare_and_swap(id.as_bytes(), None as Option<&[u8]>, Some(&data[..]))
            .map_err(storage_error)?;
        if swapped.is_err() {
            return Ok(false);
        }

        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        self.block_count.fetch_add(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(block_id = %id, size = data_len, "Stored block");
        Ok(true)
    }

    fn get(&self, id: &BlockId) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let value = self.blocks.get(id.as_bytes()).map_err(storage_error)?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    fn delete(&self, id: &BlockId) -> Result<bool> {
        match self.blocks.remove(id.as_bytes()).map_err(storage_error)? {
            Some(old) => {
                self.bytes_used.fetch_sub(old.len() as u64, Ordering::SeqCst);
                self.block_count.fetch_sub(1, Ordering::SeqCst);
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        self.blocks.contains_key(id.as_bytes()).map_err(storage_error)
    }

    fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            block_count: self.block_count.load(Ordering::SeqCst),
            bytes_used: self.bytes_used.load(Ordering::SeqCst),
            bytes_capacity: self.max_capacity,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        })
    }

    fn list_blocks(&self) -> Result<Vec<BlockId>> {
        let mut ids = Vec::new();
        for key in self.blocks.iter().keys() {
            let key = key.map_err(storage_error)?;
            let bytes: [u8; 32] = key.as_ref().try_into().map_err(|_| {
                MeshVaultError::Storage(format!("malformed block key of {} bytes", key.len()))
            })?;
            ids.push(BlockId::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let backend = SledBackend::open_temporary().unwrap();
        let id = BlockId::from_data(b"block");

        assert!(backend.put(id, Bytes::from_static(b"payload")).unwrap());
        assert!(!backend.put(id, Bytes::from_static(b"other")).unwrap());
        assert_eq!(backend.get(&id).unwrap().unwrap(), Bytes::from_static(b"payload"));
        assert!(backend.exists(&id).unwrap());

        assert!(backend.delete(&id).unwrap());
        assert!(backend.get(&id).unwrap().is_none());
        assert!(!backend.delete(&id).unwrap());
        assert_eq!(backend.stats().unwrap().block_count, 0);
    }

    #[test]
    fn test_reopen_keeps_blocks() {
        let dir = TempDir::new().unwrap();
        let ids: Vec<BlockId> = (0..4u8).map(|i| BlockId::from_data(&[i])).collect();
        {
            let backend = SledBackend::open(dir.path()).unwrap();
            for id in &ids {
                backend.put(*id, Bytes::from(vec![1u8; 10])).unwrap();
            }
            backend.flush().unwrap();
        }

        let backend = SledBackend::open(dir.path()).unwrap();
        let stats = backend.stats().unwrap();
        assert_eq!(stats.block_count, 4);
        assert_eq!(stats.bytes_used, 40);

        let mut listed = backend.list_blocks().unwrap();
        listed.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let backend = SledBackend::open_with_capacity(dir.path(), 16).unwrap();
        backend
            .put(BlockId::from_data(b"a"), Bytes::from(vec![0u8; 10]))
            .unwrap();
        assert!(matches!(
            backend.put(BlockId::from_data(b"b"), Bytes::from(vec![0u8; 10])),
            Err(MeshVaultError::Storage(_))
        ));
    }

    #[test]
    fn test_concurrent_duplicate_put_stores_once() {
        let backend = Arc::new(SledBackend::open_temporary().unwrap());
        let id = BlockId::from_data(b"contended");

        let stored: usize = std::thread::scope(|scope| {
            let writers: Vec<_> = (0..8)
                .map(|_| {
                    let backend = backend.clone();
                    scope.spawn(move || backend.put(id, Bytes::from_static(b"same block")).unwrap())
                })
                .collect();
            writers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|stored| *stored)
                .count()
        });

        assert_eq!(stored, 1);
        let stats = backend.stats().unwrap();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.bytes_used, 10);
    }
}
