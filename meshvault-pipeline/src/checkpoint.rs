//! Checkpoints
//!
//! Snapshots of caller state stored as private blocks of one member, under a
//! namespace key. A snapshot identical to the latest checkpoint is not
//! written again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshvault_core::chunk::BlockId;
use meshvault_core::crypto::ContentHash;
use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::{validate_namespace, KeyContext, StoragePolicy};
use meshvault_storage::{BlockMetadata, ContentStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Produces the state to checkpoint
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<u8>>;
}

/// One stored checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: BlockId,
    /// Starts at 1
    pub sequence: u64,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub checksum: ContentHash,
}

pub struct CheckpointManager {
    store: Arc<ContentStore>,
    policy: StoragePolicy,
    history: RwLock<Vec<Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<ContentStore>, namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        Ok(Self {
            store,
            policy: StoragePolicy::private_scoped(namespace),
            history: RwLock::new(Vec::new()),
        })
    }

    pub fn namespace(&self) -> &str {
        match &self.policy {
            StoragePolicy::PrivateScoped { namespace } => namespace,
            _ => "",
        }
    }

    /// Store a snapshot unless it matches the latest checkpoint
    pub async fn checkpoint(&self, snapshot: &[u8]) -> Result<Checkpoint> {
        let checksum = ContentHash::compute(snapshot);
        if let Some(latest) = self.latest() {
            if latest.checksum == checksum {
                debug!(sequence = latest.sequence, "Snapshot unchanged, skipping checkpoint");
                return Ok(latest);
            }
        }

        let metadata = BlockMetadata::new(snapshot.len() as u64)
            .with_mime_type("application/octet-stream");
        let id = self
            .store
            .put_with_policy(snapshot, &self.policy, KeyContext::Checkpoint, Some(metadata))
            .await?;

        let mut history = self.history.write();
        let checkpoint = Checkpoint {
            id,
            sequence: history.last().map_or(1, |c| c.sequence + 1),
            size: snapshot.len() as u64,
            created_at: Utc::now(),
            checksum,
        };
        history.push(checkpoint.clone());
        info!(
            namespace = %self.namespace(),
            sequence = checkpoint.sequence,
            size = checkpoint.size,
            "Checkpoint stored"
        );
        Ok(checkpoint)
    }

    pub fn latest(&self) -> Option<Checkpoint> {
        self.history.read().last().cloned()
    }

    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.read().clone()
    }

    /// Read a checkpoint back and check it against its recorded checksum
    pub async fn load(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let snapshot = self.store.get(&checkpoint.id, None).await?;
        if !checkpoint.checksum.verify(&snapshot) {
            return Err(MeshVaultError::VersionMismatch(format!(
                "checkpoint {} does not match its checksum",
                checkpoint.sequence
            )));
        }
        Ok(snapshot)
    }

    pub async fn load_latest(&self) -> Result<Vec<u8>> {
        let latest = self
            .latest()
            .ok_or_else(|| MeshVaultError::NotFound("no checkpoint yet".to_string()))?;
        self.load(&latest).await
    }

    /// Checkpoint `source` every `interval` until the task is stopped
    pub fn spawn(
        self: Arc<Self>,
        source: Arc<dyn SnapshotSource>,
        interval: Duration,
    ) -> CheckpointTask {
        let (shutdown, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match source.snapshot().await {
                            Ok(snapshot) => {
                                if let Err(e) = self.checkpoint(&snapshot).await {
                                    warn!(error = %e, "Periodic checkpoint failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "Snapshot source failed"),
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Checkpoint task stopped");
        });
        CheckpointTask { shutdown, handle }
    }
}

/// Handle to a periodic checkpoint task
pub struct CheckpointTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CheckpointTask {
    /// Stop ticking and wait for an in-flight checkpoint to finish
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| MeshVaultError::Internal(format!("checkpoint task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_core::identity::Identity;
    use meshvault_keys::{MasterKey, PolicyEngine};
    use meshvault_storage::{PeerNetwork, StoreConfig};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn store() -> Arc<ContentStore> {
        let store = ContentStore::join(
            PeerNetwork::new(),
            Arc::new(Identity::generate()),
            Arc::new(PolicyEngine::new(MasterKey::generate()).unwrap()),
            StoreConfig {
                replication_factor: 0,
                ..StoreConfig::default()
            },
        )
        .unwrap();
        Arc::new(store)
    }

    struct Counter(AtomicU64);

    #[async_trait]
    impl SnapshotSource for Counter {
        async fn snapshot(&self) -> Result<Vec<u8>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("state {n}").into_bytes())
        }
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_and_dedup() {
        let manager = CheckpointManager::new(store(), "training").unwrap();
        assert!(manager.load_latest().await.is_err());

        let first = manager.checkpoint(b"epoch 1").await.unwrap();
        let again = manager.checkpoint(b"epoch 1").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(manager.history().len(), 1);

        let second = manager.checkpoint(b"epoch 2").await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(manager.load_latest().await.unwrap(), b"epoch 2");
        assert_eq!(manager.load(&first).await.unwrap(), b"epoch 1");
    }

    #[test]
    fn test_reserved_namespace_rejected() {
        assert!(CheckpointManager::new(store(), "system").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checkpoints() {
        let manager = Arc::new(CheckpointManager::new(store(), "periodic").unwrap());
        let task = manager
            .clone()
            .spawn(Arc::new(Counter(AtomicU64::new(0))), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        task.stop().await.unwrap();

        let history = manager.history();
        assert!(history.len() >= 3, "only {} checkpoints", history.len());
        let latest = manager.load_latest().await.unwrap();
        assert!(String::from_utf8(latest).unwrap().starts_with("state "));
    }
}
