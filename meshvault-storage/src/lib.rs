//! MeshVault content store
//!
//! Encrypted, signed, content-addressed blocks over a simulated peer network:
//! - `BlockBackend` trait with in-memory and sled backends
//! - `EncryptedBlock` wire format (JSON) and backend format (bincode)
//! - `PeerNetwork` node registry with failures, partitions and latency
//! - `ContentStore` put/get with XOR-distance replication and healing

pub mod backend;
pub mod block;
pub mod config;
pub mod memory;
pub mod network;
pub mod node;
pub mod sled_backend;
pub mod store;

pub use backend::{BlockBackend, StorageStats};
pub use block::{BlockMetadata, EncryptedBlock};
pub use config::StoreConfig;
pub use memory::MemoryBackend;
pub use network::PeerNetwork;
pub use node::{xor_distance, Node, NodeId};
pub use sled_backend::SledBackend;
pub use store::{ContentStore, HealReport, StoreStats};
