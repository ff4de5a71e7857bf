//! Content store
//!
//! One store per node. A write seals the plaintext under the key the policy
//! engine selects (or a caller key), signs `ciphertext || nonce || tag` with
//! the node identity, inserts the block locally and replicates it to the
//! nearest reachable nodes by XOR distance. A read looks locally first, then
//! asks reachable nodes nearest-first, verifying the signature before
//! decrypting and checking the content address afterwards.

use crate::backend::{BlockBackend, StorageStats};
use crate::block::{BlockMetadata, EncryptedBlock};
use crate::config::StoreConfig;
use crate::memory::MemoryBackend;
use crate::network::PeerNetwork;
use crate::node::{nearest, sort_by_distance, Node, NodeId};
use crate::sled_backend::SledBackend;
use bytes::Bytes;
use futures::future::join_all;
use meshvault_core::chunk::BlockId;
use meshvault_core::crypto::{open, seal, EncryptionKey, NonceMode};
use meshvault_core::identity::Identity;
use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::{
    Addressing, BlockKey, KeyContext, KeyId, PolicyEngine, ProvenDhtKey, StoragePolicy,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Outcome of [`ContentStore::heal`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealReport {
    pub nodes_restored: usize,
    pub partitions_dissolved: usize,
    pub blocks_checked: usize,
    pub replicas_created: usize,
}

/// Snapshot of a store's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub puts: u64,
    pub gets: u64,
    pub dedup_hits: u64,
    pub replicas_written: u64,
    pub replica_failures: u64,
    pub remote_fetches: u64,
    pub signature_failures: u64,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    gets: AtomicU64,
    dedup_hits: AtomicU64,
    replicas_written: AtomicU64,
    replica_failures: AtomicU64,
    remote_fetches: AtomicU64,
    signature_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StoreStats {
        StoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            replicas_written: self.replicas_written.load(Ordering::Relaxed),
            replica_failures: self.replica_failures.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            signature_failures: self.signature_failures.load(Ordering::Relaxed),
        }
    }
}

/// Encrypted, signed, replicated block store of one node
pub struct ContentStore {
    node: Node,
    identity: Arc<Identity>,
    engine: Arc<PolicyEngine>,
    network: Arc<PeerNetwork>,
    backend: Arc<dyn BlockBackend>,
    config: StoreConfig,
    counters: Counters,
}

impl ContentStore {
    /// Register a node for `identity` and open its backend per `config`
    pub fn join(
        network: Arc<PeerNetwork>,
        identity: Arc<Identity>,
        engine: Arc<PolicyEngine>,
        config: StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let node = Node::new(&identity.public_key());
        let backend: Arc<dyn BlockBackend> = match &config.data_dir {
            Some(dir) => Arc::new(SledBackend::open_with_capacity(
                dir.join(node.node_id.to_hex()),
                config.capacity_bytes,
            )?),
            None => Arc::new(MemoryBackend::with_capacity(config.capacity_bytes)),
        };
        Self::join_with_backend(network, identity, engine, config, backend)
    }

    /// Register a node with an explicit backend
    pub fn join_with_backend(
        network: Arc<PeerNetwork>,
        identity: Arc<Identity>,
        engine: Arc<PolicyEngine>,
        config: StoreConfig,
        backend: Arc<dyn BlockBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let node = Node::new(&identity.public_key());
        network.register(node.clone(), backend.clone())?;

        Ok(Self {
            node,
            identity,
            engine,
            network,
            backend,
            config,
            counters: Counters::default(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node.node_id
    }

    /// Current view of this store's node
    pub fn node(&self) -> Node {
        self.network
            .node(&self.node.node_id)
            .unwrap_or_else(|| self.node.clone())
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub fn network(&self) -> &Arc<PeerNetwork> {
        &self.network
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }

    pub fn backend_stats(&self) -> Result<StorageStats> {
        self.backend.stats()
    }

    /// Whether a block is held locally
    pub fn contains(&self, block_id: &BlockId) -> Result<bool> {
        self.backend.exists(block_id)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.network.is_online(&self.node.node_id) {
            Ok(())
        } else {
            Err(MeshVaultError::NodeUnavailable(format!(
                "{} is offline",
                self.node.node_id.short()
            )))
        }
    }

    fn external_key(key: &EncryptionKey) -> BlockKey {
        BlockKey {
            key: key.clone(),
            key_id: KeyId::External {
                context: KeyContext::File,
            },
            nonce_mode: NonceMode::Random,
            addressing: Addressing::Ciphertext,
        }
    }

    fn block_key(&self, plaintext: &[u8], key: Option<&EncryptionKey>) -> Result<BlockKey> {
        match key {
            Some(key) => Ok(Self::external_key(key)),
            None => self
                .engine
                .block_key(&self.config.default_policy, plaintext, KeyContext::File),
        }
    }

    /// Store plaintext under a caller key, or under the default policy
    pub async fn put(&self, plaintext: &[u8], key: Option<&EncryptionKey>) -> Result<BlockId> {
        let block_key = self.block_key(plaintext, key)?;
        self.store(plaintext, block_key, None).await
    }

    pub async fn put_with_metadata(
        &self,
        plaintext: &[u8],
        key: Option<&EncryptionKey>,
        metadata: BlockMetadata,
    ) -> Result<BlockId> {
        let block_key = self.block_key(plaintext, key)?;
        self.store(plaintext, block_key, Some(metadata)).await
    }

    /// Store plaintext under an explicit policy
    pub async fn put_with_policy(
        &self,
        plaintext: &[u8],
        policy: &StoragePolicy,
        context: KeyContext,
        metadata: Option<BlockMetadata>,
    ) -> Result<BlockId> {
        let block_key = self.engine.block_key(policy, plaintext, context)?;
        self.store(plaintext, block_key, metadata).await
    }

    /// Seal and sign without storing
    fn seal_block(
        &self,
        plaintext: &[u8],
        block_key: &BlockKey,
        metadata: Option<BlockMetadata>,
    ) -> Result<(BlockId, EncryptedBlock)> {
        let aad = block_key.key_id.to_string();
        let sealed = seal(plaintext, &block_key.key, aad.as_bytes(), block_key.nonce_mode)?;
        let signature = self.identity.sign(&sealed.signing_bytes());

        let block = EncryptedBlock {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            auth_tag: sealed.auth_tag,
            signature: signature.to_vec(),
            key_id: block_key.key_id.clone(),
            public_key: self.identity.public_key().to_vec(),
            metadata,
        };
        let id = match block_key.addressing {
            Addressing::Plaintext(id) => id,
            Addressing::Ciphertext => block.sealed_address(),
        };
        Ok((id, block))
    }

    #[instrument(skip(self, plaintext, block_key, metadata), fields(node = %self.node.node_id.short(), size = plaintext.len()))]
    async fn store(
        &self,
        plaintext: &[u8],
        block_key: BlockKey,
        metadata: Option<BlockMetadata>,
    ) -> Result<BlockId> {
        self.ensure_online()?;

        if let Addressing::Plaintext(id) = block_key.addressing {
            if self.backend.exists(&id)? {
                Counters::bump(&self.counters.dedup_hits);
                debug!(block_id = %id, "Dedup hit");
                return Ok(id);
            }
        }

        let (id, block) = self.seal_block(plaintext, &block_key, metadata)?;
        let bytes = block.to_bytes()?;
        if !self.backend.put(id, bytes.clone())? {
            Counters::bump(&self.counters.dedup_hits);
            return Ok(id);
        }
        Counters::bump(&self.counters.puts);

        let replicas = self.replicate(id, bytes).await;
        if matches!(block_key.key_id, KeyId::Namespace { .. }) {
            let holders: Vec<NodeId> = std::iter::once(self.node.node_id)
                .chain(replicas.iter().copied())
                .collect();
            self.announce_holders(&id, &block_key.key_id, &holders)?;
        }
        debug!(block_id = %id, key_id = %block_key.key_id, replicas = replicas.len(), "Stored block");
        Ok(id)
    }

    /// Seal a block here and place it on exactly one node
    ///
    /// Used for explicit placement (erasure shards); no extra replicas are
    /// written. Returns the address and whether the target already held it.
    #[instrument(skip(self, target, plaintext, policy, metadata), fields(target = %target.short(), size = plaintext.len()))]
    pub async fn put_on(
        &self,
        target: &NodeId,
        plaintext: &[u8],
        policy: &StoragePolicy,
        context: KeyContext,
        metadata: Option<BlockMetadata>,
    ) -> Result<(BlockId, bool)> {
        self.ensure_online()?;
        let block_key = self.engine.block_key(policy, plaintext, context)?;
        let (id, block) = self.seal_block(plaintext, &block_key, metadata)?;
        let bytes = block.to_bytes()?;

        let written = if *target == self.node.node_id {
            self.backend.put(id, bytes)?
        } else {
            self.network
                .deliver(&self.node.node_id, target, id, bytes)
                .await?
        };

        if written {
            Counters::bump(&self.counters.puts);
        } else {
            Counters::bump(&self.counters.dedup_hits);
        }
        Ok((id, !written))
    }

    /// Copy a stored block to the nearest reachable nodes; returns the nodes
    /// that accepted a copy
    async fn replicate(&self, id: BlockId, bytes: Bytes) -> Vec<NodeId> {
        if self.config.replication_factor == 0 {
            return Vec::new();
        }

        let targets = self.find_nodes(&id);
        let from = self.node.node_id;
        let results = join_all(targets.iter().map(|target| {
            let bytes = bytes.clone();
            async move { (target, self.network.deliver(&from, target, id, bytes).await) }
        }))
        .await;

        let mut written = Vec::new();
        for (target, result) in results {
            match result {
                Ok(_) => {
                    written.push(*target);
                    Counters::bump(&self.counters.replicas_written);
                }
                Err(e) => {
                    Counters::bump(&self.counters.replica_failures);
                    warn!(block_id = %id, target = %target.short(), error = %e, "Replica write failed");
                }
            }
        }
        written
    }

    fn mine_locator(&self, key_id: &KeyId, block_id: &BlockId) -> Result<ProvenDhtKey> {
        let locator = self.engine.locator(key_id, block_id)?;
        ProvenDhtKey::mine(locator, self.config.locator_difficulty)
    }

    fn announce_holders(&self, block_id: &BlockId, key_id: &KeyId, holders: &[NodeId]) -> Result<()> {
        let proof = self.mine_locator(key_id, block_id)?;
        for holder in holders {
            if let Err(e) = self
                .network
                .announce(holder, &proof, self.config.locator_difficulty)
            {
                warn!(block_id = %block_id, holder = %holder.short(), error = %e, "Locator announcement failed");
            }
        }
        Ok(())
    }

    /// Announce this node as a holder of a local block under its private
    /// locator
    pub fn announce(&self, block_id: &BlockId) -> Result<ProvenDhtKey> {
        self.ensure_online()?;
        let bytes = self
            .backend
            .get(block_id)?
            .ok_or_else(|| MeshVaultError::NotFound(format!("block {block_id}")))?;
        let block = EncryptedBlock::from_bytes(&bytes)?;
        let proof = self.mine_locator(&block.key_id, block_id)?;
        self.network
            .announce(&self.node.node_id, &proof, self.config.locator_difficulty)?;
        Ok(proof)
    }

    /// Nodes that announced a block whose key this node can derive
    pub fn locate(&self, block_id: &BlockId, key_id: &KeyId) -> Result<Vec<NodeId>> {
        let locator = self.engine.locator(key_id, block_id)?;
        Ok(self.network.locate(&locator))
    }

    /// Nodes a write from here replicates to: the `replication_factor`
    /// reachable nodes nearest to `block_id`
    pub fn find_nodes(&self, block_id: &BlockId) -> Vec<NodeId> {
        nearest(
            self.network.reachable_nodes(&self.node.node_id),
            block_id,
            self.config.replication_factor,
        )
    }

    /// Read and decrypt a block
    ///
    /// Without a key the policy engine re-derives it from the block's key id.
    pub async fn get(&self, block_id: &BlockId, key: Option<&EncryptionKey>) -> Result<Vec<u8>> {
        let block = self.get_block(block_id).await?;
        self.open_block(block_id, &block, key)
    }

    /// Read a block from one specific node
    pub async fn get_from(
        &self,
        node_id: &NodeId,
        block_id: &BlockId,
        key: Option<&EncryptionKey>,
    ) -> Result<Vec<u8>> {
        let block = self.get_block_from(node_id, block_id).await?;
        self.open_block(block_id, &block, key)
    }

    /// Signature-checked raw block, from here or the nearest reachable holder
    #[instrument(skip(self), fields(node = %self.node.node_id.short()))]
    pub async fn get_block(&self, block_id: &BlockId) -> Result<EncryptedBlock> {
        self.ensure_online()?;
        Counters::bump(&self.counters.gets);

        if let Some(bytes) = self.backend.get(block_id)? {
            let block = EncryptedBlock::from_bytes(&bytes)?;
            self.verify(block_id, &block)?;
            return Ok(block);
        }

        let mut candidates = self.network.reachable_nodes(&self.node.node_id);
        sort_by_distance(&mut candidates, block_id);

        for candidate in candidates {
            match self.fetch_remote(&candidate, block_id).await {
                Ok(Some(block)) => {
                    self.verify(block_id, &block)?;
                    return Ok(block);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(block_id = %block_id, node = %candidate.short(), error = %e, "Replica unavailable, trying next");
                }
            }
        }

        Err(MeshVaultError::NotFound(format!("block {block_id}")))
    }

    /// Signature-checked raw block held by `node_id`
    pub async fn get_block_from(&self, node_id: &NodeId, block_id: &BlockId) -> Result<EncryptedBlock> {
        self.ensure_online()?;
        Counters::bump(&self.counters.gets);

        let block = if *node_id == self.node.node_id {
            match self.backend.get(block_id)? {
                Some(bytes) => Some(EncryptedBlock::from_bytes(&bytes)?),
                None => None,
            }
        } else {
            self.fetch_remote(node_id, block_id).await?
        };

        let block = block.ok_or_else(|| {
            MeshVaultError::NotFound(format!("block {block_id} on {}", node_id.short()))
        })?;
        self.verify(block_id, &block)?;
        Ok(block)
    }

    async fn fetch_remote(&self, node_id: &NodeId, block_id: &BlockId) -> Result<Option<EncryptedBlock>> {
        Counters::bump(&self.counters.remote_fetches);
        let fetch = self.network.fetch(&self.node.node_id, node_id, block_id);
        match tokio::time::timeout(self.config.fetch_timeout(), fetch).await {
            Ok(result) => result,
            Err(_) => Err(MeshVaultError::NodeUnavailable(format!(
                "{} timed out after {:?}",
                node_id.short(),
                self.config.fetch_timeout()
            ))),
        }
    }

    fn verify(&self, block_id: &BlockId, block: &EncryptedBlock) -> Result<()> {
        block.verify_signature(block_id).inspect_err(|_| {
            Counters::bump(&self.counters.signature_failures);
            warn!(block_id = %block_id, "Block signature rejected");
        })
    }

    /// Decrypt a verified block and check it against its address
    pub fn open_block(
        &self,
        block_id: &BlockId,
        block: &EncryptedBlock,
        key: Option<&EncryptionKey>,
    ) -> Result<Vec<u8>> {
        let key = match key {
            Some(key) => key.clone(),
            None => self.engine.resolve_key(&block.key_id, block_id)?,
        };
        let aad = block.key_id.to_string();
        let plaintext = open(&block.sealed(), &key, aad.as_bytes())?;

        let address = match self.engine.addressing(&block.key_id, &plaintext)? {
            Addressing::Plaintext(id) => id,
            Addressing::Ciphertext => block.sealed_address(),
        };
        if address != *block_id {
            return Err(MeshVaultError::Decryption(format!(
                "content of block {block_id} does not match its address"
            )));
        }
        Ok(plaintext)
    }

    /// Local blocks whose metadata matches `predicate`
    pub fn query_metadata<F>(&self, predicate: F) -> Result<Vec<(BlockId, EncryptedBlock)>>
    where
        F: Fn(&BlockMetadata) -> bool,
    {
        let mut matches = Vec::new();
        for id in self.backend.list_blocks()? {
            let Some(bytes) = self.backend.get(&id)? else {
                continue;
            };
            let block = EncryptedBlock::from_bytes(&bytes)?;
            if block.metadata.as_ref().is_some_and(&predicate) {
                matches.push((id, block));
            }
        }
        matches.sort_by_key(|(id, _)| *id);
        Ok(matches)
    }

    pub fn find_by_mime_type(&self, mime_type: &str) -> Result<Vec<(BlockId, EncryptedBlock)>> {
        self.query_metadata(|meta| meta.mime_type.as_deref() == Some(mime_type))
    }

    /// Take a node offline
    pub fn simulate_node_failure(&self, node_id: &NodeId) -> Result<()> {
        self.network.set_online(node_id, false)?;
        warn!(node_id = %node_id.short(), "Simulated node failure");
        Ok(())
    }

    /// Bring one node back online
    pub fn restore_node(&self, node_id: &NodeId) -> Result<()> {
        self.network.set_online(node_id, true)?;
        info!(node_id = %node_id.short(), "Node restored");
        Ok(())
    }

    /// Split the network; nodes listed in no group are isolated
    pub fn simulate_network_partition(&self, groups: Vec<Vec<NodeId>>) -> Result<()> {
        let groups: Vec<HashSet<NodeId>> = groups
            .into_iter()
            .map(|group| group.into_iter().collect())
            .collect();
        self.network.set_partitions(groups)
    }

    /// Delay every transfer served by `node_id`
    pub fn simulate_latency(&self, node_id: &NodeId, latency: Duration) -> Result<()> {
        self.network.set_latency(node_id, latency)
    }

    /// Restore every node, dissolve partitions and re-replicate every block to
    /// its nearest nodes
    #[instrument(skip(self), fields(node = %self.node.node_id.short()))]
    pub async fn heal(&self) -> Result<HealReport> {
        let mut report = HealReport {
            nodes_restored: self.network.restore_all(),
            partitions_dissolved: self.network.clear_partitions(),
            ..HealReport::default()
        };

        // First holder of every block, in a stable order
        let mut holders: BTreeMap<BlockId, NodeId> = BTreeMap::new();
        for node_id in self.network.node_ids() {
            let Some(backend) = self.network.backend(&node_id) else {
                continue;
            };
            for id in backend.list_blocks()? {
                holders.entry(id).or_insert(node_id);
            }
        }
        report.blocks_checked = holders.len();

        if self.config.replication_factor > 0 {
            let online: Vec<NodeId> = self
                .network
                .node_ids()
                .into_iter()
                .filter(|id| self.network.is_online(id))
                .collect();

            for (id, holder) in &holders {
                let Some(bytes) = self.network.backend(holder).and_then(|b| b.get(id).ok().flatten())
                else {
                    continue;
                };
                for target in nearest(online.clone(), id, self.config.replication_factor) {
                    match self.network.deliver(holder, &target, *id, bytes.clone()).await {
                        Ok(true) => report.replicas_created += 1,
                        Ok(false) => {}
                        Err(e) => warn!(block_id = %id, error = %e, "Heal replica failed"),
                    }
                }
            }
        }

        info!(
            nodes_restored = report.nodes_restored,
            partitions_dissolved = report.partitions_dissolved,
            blocks_checked = report.blocks_checked,
            replicas_created = report.replicas_created,
            "Network healed"
        );
        Ok(report)
    }
}
