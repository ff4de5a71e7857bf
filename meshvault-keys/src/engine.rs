//! Policy engine
//!
//! Turns a [`StoragePolicy`] and a plaintext into everything a block write
//! needs: the AEAD key, a key identifier that travels with the block, the
//! nonce mode and how the block is addressed. Reads go the other way:
//! [`PolicyEngine::resolve_key`] rebuilds the key from the identifier.
//!
//! Key identifiers:
//!
//! | Policy          | Key id                       | Address                  |
//! |-----------------|------------------------------|--------------------------|
//! | PrivateMax      | `pm:<salt>:<ctx>`            | hash of sealed bytes     |
//! | PrivateScoped   | `ns:<namespace>:v<n>:<ctx>`  | keyed plaintext hash     |
//! | GroupScoped     | `grp:<group>:v<n>:<ctx>`     | scoped plaintext hash    |
//! | PublicMarkdown  | `pub:<ctx>`                  | global plaintext hash    |
//! | caller key      | `ext:<ctx>`                  | hash of sealed bytes     |

use crate::derivation::{
    derive_dht_key, derive_namespace_key, derive_object_key, DhtKey, KeyContext, MasterKey,
};
use crate::group::GroupKeyManager;
use crate::keyring::NamespaceKeyring;
use crate::policy::StoragePolicy;
use hkdf::Hkdf;
use meshvault_core::chunk::BlockId;
use meshvault_core::crypto::{EncryptionKey, NonceMode, KEY_SIZE};
use meshvault_core::{MeshVaultError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

const PRIVATE_MAX_SALT_SIZE: usize = 16;
const NAMESPACE_SCOPE: &str = "private";
const NAMESPACE_ADDRESS_SCOPE: &str = "address";
// Never rotated
const NAMESPACE_ADDRESS_VERSION: u32 = 0;
const PUBLIC_CONVERGENT_SALT: &[u8] = b"meshvault public convergent key v1";

/// Parsed form of a block's key identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyId {
    PrivateMax {
        salt: [u8; PRIVATE_MAX_SALT_SIZE],
        context: KeyContext,
    },
    Namespace {
        namespace: String,
        version: u32,
        context: KeyContext,
    },
    Group {
        group_id: String,
        version: u32,
        context: KeyContext,
    },
    Public {
        context: KeyContext,
    },
    /// Key supplied by the caller, not derivable by the engine
    External {
        context: KeyContext,
    },
}

impl KeyId {
    pub fn context(&self) -> KeyContext {
        match self {
            Self::PrivateMax { context, .. }
            | Self::Namespace { context, .. }
            | Self::Group { context, .. }
            | Self::Public { context }
            | Self::External { context } => *context,
        }
    }

    /// Whether blocks under this identifier are addressed by their plaintext
    pub fn is_plaintext_addressed(&self) -> bool {
        match self {
            Self::Namespace { .. } | Self::Group { .. } | Self::Public { .. } => true,
            Self::PrivateMax { .. } | Self::External { .. } => false,
        }
    }

    /// Nonce mode used when sealing under this identifier
    pub fn nonce_mode(&self) -> NonceMode {
        if self.is_plaintext_addressed() {
            NonceMode::Synthetic
        } else {
            NonceMode::Random
        }
    }
}

fn parse_version(s: &str) -> Option<u32> {
    s.strip_prefix('v')?.parse().ok()
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateMax { salt, context } => write!(f, "pm:{}:{context}", hex::encode(salt)),
            Self::Namespace {
                namespace,
                version,
                context,
            } => write!(f, "ns:{namespace}:v{version}:{context}"),
            Self::Group {
                group_id,
                version,
                context,
            } => write!(f, "grp:{group_id}:v{version}:{context}"),
            Self::Public { context } => write!(f, "pub:{context}"),
            Self::External { context } => write!(f, "ext:{context}"),
        }
    }
}

impl FromStr for KeyId {
    type Err = MeshVaultError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MeshVaultError::Policy(format!("malformed key id {s:?}"));
        let parts: Vec<&str> = s.split(':').collect();
        let context = parts
            .last()
            .and_then(|c| KeyContext::from_label(c))
            .ok_or_else(invalid)?;

        match parts.as_slice() {
            ["pm", salt, _] => {
                let bytes = hex::decode(salt).map_err(|_| invalid())?;
                let salt: [u8; PRIVATE_MAX_SALT_SIZE] =
                    bytes.try_into().map_err(|_| invalid())?;
                Ok(Self::PrivateMax { salt, context })
            }
            ["ns", namespace, version, _] => Ok(Self::Namespace {
                namespace: namespace.to_string(),
                version: parse_version(version).ok_or_else(invalid)?,
                context,
            }),
            ["grp", group_id, version, _] => Ok(Self::Group {
                group_id: group_id.to_string(),
                version: parse_version(version).ok_or_else(invalid)?,
                context,
            }),
            ["pub", _] => Ok(Self::Public { context }),
            ["ext", _] => Ok(Self::External { context }),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for KeyId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a block's content address comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Deterministic address known before sealing
    Plaintext(BlockId),
    /// Hash of `ciphertext || nonce || tag`, known after sealing
    Ciphertext,
}

/// Everything needed to seal one block
#[derive(Debug, Clone)]
pub struct BlockKey {
    pub key: EncryptionKey,
    pub key_id: KeyId,
    pub nonce_mode: NonceMode,
    pub addressing: Addressing,
}

/// Derives block keys for every policy from one master key
pub struct PolicyEngine {
    master: Arc<MasterKey>,
    private_root: EncryptionKey,
    namespaces: NamespaceKeyring,
    groups: Arc<GroupKeyManager>,
}

impl PolicyEngine {
    pub fn new(master: MasterKey) -> Result<Self> {
        Self::with_groups(master, Arc::new(GroupKeyManager::new()))
    }

    /// Engine sharing a group key manager with other engines
    pub fn with_groups(master: MasterKey, groups: Arc<GroupKeyManager>) -> Result<Self> {
        let master = Arc::new(master);
        let private_root =
            derive_namespace_key(&master, "private_max_root", "pm", 1)?;
        Ok(Self {
            namespaces: NamespaceKeyring::new(master.clone(), NAMESPACE_SCOPE),
            master,
            private_root,
            groups,
        })
    }

    pub fn master_fingerprint(&self) -> String {
        self.master.fingerprint()
    }

    pub fn namespaces(&self) -> &NamespaceKeyring {
        &self.namespaces
    }

    pub fn groups(&self) -> &Arc<GroupKeyManager> {
        &self.groups
    }

    /// Rotate a namespace key; later writes use the new version
    pub fn rotate_namespace(&self, namespace: &str) -> Result<u32> {
        self.namespaces.rotate(namespace)
    }

    /// Select key, identifier, nonce mode and addressing for a write
    #[instrument(skip(self, policy, plaintext), fields(policy = %policy, size = plaintext.len()))]
    pub fn block_key(
        &self,
        policy: &StoragePolicy,
        plaintext: &[u8],
        context: KeyContext,
    ) -> Result<BlockKey> {
        policy.validate()?;
        policy.validate_content(plaintext)?;

        let key_id = match policy {
            StoragePolicy::PrivateMax => {
                let mut salt = [0u8; PRIVATE_MAX_SALT_SIZE];
                rand::rngs::OsRng.fill_bytes(&mut salt);
                KeyId::PrivateMax { salt, context }
            }
            StoragePolicy::PrivateScoped { namespace } => {
                let (version, _) = self.namespaces.active_key(namespace)?;
                KeyId::Namespace {
                    namespace: namespace.clone(),
                    version,
                    context,
                }
            }
            StoragePolicy::GroupScoped { group_id } => {
                let version = self.groups.active_version(group_id).ok_or_else(|| {
                    MeshVaultError::Namespace(format!("no key for group {group_id}"))
                })?;
                KeyId::Group {
                    group_id: group_id.clone(),
                    version,
                    context,
                }
            }
            StoragePolicy::PublicMarkdown => KeyId::Public { context },
        };

        let addressing = self.addressing(&key_id, plaintext)?;
        let key = self.key_for(&key_id, &addressing)?;
        debug!(key_id = %key_id, "Selected block key");

        Ok(BlockKey {
            nonce_mode: key_id.nonce_mode(),
            key,
            key_id,
            addressing,
        })
    }

    /// Re-derive the key of a stored block from its identifier and address
    pub fn resolve_key(&self, key_id: &KeyId, address: &BlockId) -> Result<EncryptionKey> {
        let addressing = if key_id.is_plaintext_addressed() {
            Addressing::Plaintext(*address)
        } else {
            Addressing::Ciphertext
        };
        self.key_for(key_id, &addressing)
    }

    /// DHT locator of a stored block; only holders of its key can compute it
    pub fn locator(&self, key_id: &KeyId, address: &BlockId) -> Result<DhtKey> {
        let key = self.resolve_key(key_id, address)?;
        derive_dht_key(&key, address.as_bytes())
    }

    /// How a block sealed under `key_id` is addressed.
    ///
    /// Namespace addresses are keyed by a secret derived from the master key,
    /// so two masters never share an address for the same plaintext and a
    /// rotation leaves the address unchanged.
    pub fn addressing(&self, key_id: &KeyId, plaintext: &[u8]) -> Result<Addressing> {
        let scope = match key_id {
            KeyId::Namespace { namespace, .. } => {
                let address_key = derive_namespace_key(
                    &self.master,
                    namespace,
                    NAMESPACE_ADDRESS_SCOPE,
                    NAMESPACE_ADDRESS_VERSION,
                )?;
                format!("ns:{namespace}:{}", hex::encode(address_key.as_bytes()))
            }
            KeyId::Group { group_id, .. } => format!("grp:{group_id}"),
            KeyId::Public { .. } => "pub".to_string(),
            KeyId::PrivateMax { .. } | KeyId::External { .. } => return Ok(Addressing::Ciphertext),
        };
        Ok(Addressing::Plaintext(BlockId::scoped(&scope, plaintext)))
    }

    fn key_for(&self, key_id: &KeyId, addressing: &Addressing) -> Result<EncryptionKey> {
        let address = match addressing {
            Addressing::Plaintext(address) => Some(address),
            Addressing::Ciphertext => None,
        };
        let require_address = || {
            address.ok_or_else(|| {
                MeshVaultError::Internal(format!("key id {key_id} needs a plaintext address"))
            })
        };

        match key_id {
            KeyId::PrivateMax { salt, context } => derive_object_key(&self.private_root, salt, *context),
            KeyId::Namespace {
                namespace,
                version,
                context,
            } => {
                let ns_key = self.namespaces.key_for_version(namespace, *version)?;
                derive_object_key(&ns_key, require_address()?.as_bytes(), *context)
            }
            KeyId::Group {
                group_id,
                version,
                context,
            } => {
                let group_key = self.groups.key_for_version(group_id, *version)?;
                derive_object_key(&group_key, require_address()?.as_bytes(), *context)
            }
            KeyId::Public { context } => convergent_key(require_address()?, *context),
            KeyId::External { .. } => Err(MeshVaultError::Encryption(
                "block was sealed with a caller-supplied key".to_string(),
            )),
        }
    }
}

/// Key any holder of a public address can derive
fn convergent_key(address: &BlockId, context: KeyContext) -> Result<EncryptionKey> {
    let hk = Hkdf::<Sha256>::new(Some(PUBLIC_CONVERGENT_SALT), address.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(context.label().as_bytes(), &mut okm)
        .map_err(|e| MeshVaultError::Internal(format!("HKDF expand failed: {e}")))?;
    Ok(EncryptionKey::from_bytes(okm))
}
