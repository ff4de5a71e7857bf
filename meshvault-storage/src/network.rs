//! Simulated peer network
//!
//! The registry of nodes, their block backends and their connectivity.
//! Transfers between nodes go through [`PeerNetwork::fetch`] and
//! [`PeerNetwork::deliver`], which honour online state, partitions and
//! per-node latency. Connectivity is only changed through the content store.

use crate::backend::BlockBackend;
use crate::block::EncryptedBlock;
use crate::node::{Node, NodeId};
use bytes::Bytes;
use meshvault_core::chunk::BlockId;
use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::{DhtKey, ProvenDhtKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

struct Peer {
    node: Node,
    backend: Arc<dyn BlockBackend>,
    latency: Duration,
}

/// Registry shared by every store joined to the same network
#[derive(Default)]
pub struct PeerNetwork {
    peers: RwLock<HashMap<NodeId, Peer>>,
    /// `None` when fully connected; nodes in no group are isolated
    partitions: RwLock<Option<Vec<HashSet<NodeId>>>>,
    /// Private block locators and the nodes that announced them
    locators: RwLock<HashMap<DhtKey, HashSet<NodeId>>>,
}

impl PeerNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node and the backend that holds its blocks
    pub fn register(&self, node: Node, backend: Arc<dyn BlockBackend>) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(&node.node_id) {
            return Err(MeshVaultError::Configuration(format!(
                "node {} is already registered",
                node.node_id.short()
            )));
        }
        info!(node_id = %node.node_id.short(), address = %node.address, "Node joined");
        peers.insert(
            node.node_id,
            Peer {
                node,
                backend,
                latency: Duration::ZERO,
            },
        );
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.peers.read().get(id).map(|p| p.node.clone())
    }

    /// All nodes, ordered by id
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.peers.read().values().map(|p| p.node.clone()).collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub(crate) fn backend(&self, id: &NodeId) -> Option<Arc<dyn BlockBackend>> {
        self.peers.read().get(id).map(|p| p.backend.clone())
    }

    pub fn is_online(&self, id: &NodeId) -> bool {
        self.peers.read().get(id).is_some_and(|p| p.node.is_online)
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitions.read().is_some()
    }

    /// Whether `from` can currently exchange blocks with `to`
    pub fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        if !self.is_online(from) || !self.is_online(to) {
            return false;
        }
        if from == to {
            return true;
        }
        match self.partitions.read().as_ref() {
            None => true,
            Some(groups) => groups
                .iter()
                .any(|group| group.contains(from) && group.contains(to)),
        }
    }

    /// Other nodes `from` can reach, ordered by id
    pub fn reachable_nodes(&self, from: &NodeId) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|id| id != from && self.reachable(from, id))
            .collect()
    }

    /// Record that `holder` stores the block behind `locator`.
    ///
    /// Announcements whose proof of work falls short of `difficulty` are
    /// rejected, which keeps enumerating private locators expensive.
    pub fn announce(&self, holder: &NodeId, locator: &ProvenDhtKey, difficulty: u32) -> Result<()> {
        if !locator.verify(difficulty) {
            return Err(MeshVaultError::Policy(format!(
                "locator {} lacks {difficulty} bits of work",
                locator.key.to_hex()
            )));
        }
        if !self.is_online(holder) {
            return Err(MeshVaultError::NodeUnavailable(format!(
                "{} is offline",
                holder.short()
            )));
        }
        self.locators
            .write()
            .entry(locator.key)
            .or_default()
            .insert(*holder);
        debug!(locator = %locator.key.to_hex(), holder = %holder.short(), "Locator announced");
        Ok(())
    }

    /// Nodes that announced `locator`, ordered by id
    pub fn locate(&self, locator: &DhtKey) -> Vec<NodeId> {
        let mut holders: Vec<NodeId> = self
            .locators
            .read()
            .get(locator)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    /// Nodes currently holding a block
    pub fn holders(&self, block_id: &BlockId) -> Vec<NodeId> {
        let peers: Vec<(NodeId, Arc<dyn BlockBackend>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, p)| (*id, p.backend.clone()))
            .collect();
        let mut holders: Vec<NodeId> = peers
            .into_iter()
            .filter(|(_, backend)| backend.exists(block_id).unwrap_or(false))
            .map(|(id, _)| id)
            .collect();
        holders.sort();
        holders
    }

    fn transfer_target(&self, from: &NodeId, to: &NodeId) -> Result<(Arc<dyn BlockBackend>, Duration)> {
        if !self.reachable(from, to) {
            return Err(MeshVaultError::NodeUnavailable(format!(
                "{} is not reachable from {}",
                to.short(),
                from.short()
            )));
        }
        let peers = self.peers.read();
        let peer = peers
            .get(to)
            .ok_or_else(|| MeshVaultError::NodeUnavailable(format!("unknown node {}", to.short())))?;
        Ok((peer.backend.clone(), peer.latency))
    }

    /// Read a block held by `to` on behalf of `from`
    pub async fn fetch(&self, from: &NodeId, to: &NodeId, block_id: &BlockId) -> Result<Option<EncryptedBlock>> {
        let (backend, latency) = self.transfer_target(from, to)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match backend.get(block_id)? {
            Some(bytes) => Ok(Some(EncryptedBlock::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a block to `to` on behalf of `from`; `false` if it was already there
    pub async fn deliver(&self, from: &NodeId, to: &NodeId, block_id: BlockId, data: Bytes) -> Result<bool> {
        let (backend, latency) = self.transfer_target(from, to)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        backend.put(block_id, data)
    }

    pub(crate) fn set_online(&self, id: &NodeId, online: bool) -> Result<()> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| MeshVaultError::NotFound(format!("node {}", id.short())))?;
        peer.node.is_online = online;
        debug!(node_id = %id.short(), online, "Node state changed");
        Ok(())
    }

    /// Bring every node back online, returning how many were offline
    pub(crate) fn restore_all(&self) -> usize {
        let mut peers = self.peers.write();
        let mut restored = 0;
        for peer in peers.values_mut() {
            if !peer.node.is_online {
                peer.node.is_online = true;
                restored += 1;
            }
        }
        restored
    }

    pub(crate) fn set_partitions(&self, groups: Vec<HashSet<NodeId>>) -> Result<()> {
        {
            let peers = self.peers.read();
            if let Some(unknown) = groups.iter().flatten().find(|id| !peers.contains_key(*id)) {
                return Err(MeshVaultError::NotFound(format!("node {}", unknown.short())));
            }
        }
        info!(groups = groups.len(), "Network partitioned");
        *self.partitions.write() = Some(groups);
        Ok(())
    }

    /// Number of partition groups dissolved
    pub(crate) fn clear_partitions(&self) -> usize {
        self.partitions.write().take().map_or(0, |groups| groups.len())
    }

    pub(crate) fn set_latency(&self, id: &NodeId, latency: Duration) -> Result<()> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(id)
            .ok_or_else(|| MeshVaultError::NotFound(format!("node {}", id.short())))?;
        peer.latency = latency;
        Ok(())
    }
}
