//! Nodes and XOR-distance ordering
//!
//! A node id is the Blake3 hash of the node's Ed25519 public key. Replica
//! placement ranks nodes by the Hamming weight of `node_id XOR block_id`,
//! breaking ties by node id so every participant computes the same order.

use meshvault_core::chunk::BlockId;
use meshvault_core::{MeshVaultError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a storage node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MeshVaultError::Configuration(format!("invalid node id: {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            MeshVaultError::Configuration("invalid node id: expected 32 bytes".to_string())
        })?;
        Ok(Self(arr))
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A participant in the peer network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: NodeId,
    pub address: String,
    #[serde(with = "crate::block::hex_bytes")]
    pub public_key: Vec<u8>,
    pub is_online: bool,
}

impl Node {
    pub fn new(public_key: &[u8]) -> Self {
        let node_id = NodeId::from_public_key(public_key);
        Self {
            address: format!("mem://{}", node_id.short()),
            node_id,
            public_key: public_key.to_vec(),
            is_online: true,
        }
    }
}

/// Number of differing bits between a node id and a block address
pub fn xor_distance(node: &NodeId, block: &BlockId) -> u32 {
    node.as_bytes()
        .iter()
        .zip(block.as_bytes())
        .map(|(a, b)| (a ^ b).count_ones())
        .sum()
}

fn closer(block: &BlockId, a: &NodeId, b: &NodeId) -> Ordering {
    xor_distance(a, block)
        .cmp(&xor_distance(b, block))
        .then_with(|| a.cmp(b))
}

/// Sort node ids nearest-first relative to `block`
pub fn sort_by_distance(nodes: &mut [NodeId], block: &BlockId) {
    nodes.sort_by(|a, b| closer(block, a, b));
}

/// The `count` nodes nearest to `block`
pub fn nearest(mut nodes: Vec<NodeId>, block: &BlockId, count: usize) -> Vec<NodeId> {
    sort_by_distance(&mut nodes, block);
    nodes.truncate(count);
    nodes
}
