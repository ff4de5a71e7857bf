//! MeshVault namespace and policy engine
//!
//! Storage policies and the key hierarchy behind them:
//! - Policy variants, descriptors and allowed transitions
//! - Constant-time namespace validation
//! - HKDF/HMAC namespace, object and DHT key derivation
//! - Versioned namespace keyrings and X25519-wrapped group keys
//! - [`PolicyEngine`], which picks the key, nonce mode and address of each block

pub mod derivation;
pub mod engine;
pub mod group;
pub mod keyring;
pub mod namespace;
pub mod policy;

pub use derivation::{
    derive_dht_key, derive_namespace_key, derive_object_key, DhtKey, KeyContext, MasterKey,
    ProvenDhtKey,
};
pub use engine::{Addressing, BlockKey, KeyId, PolicyEngine};
pub use group::{GroupKeyManager, GroupMember, WrappedKey};
pub use keyring::NamespaceKeyring;
pub use namespace::{is_valid_namespace, validate_namespace};
pub use policy::{
    validate_transition, DedupScope, EncryptionMode, PolicyDescriptor, StoragePolicy,
    TransitionPlan,
};
