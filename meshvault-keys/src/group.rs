//! Group keys
//!
//! Each group has a random 32-byte key per version. The key is wrapped for
//! every member with an ephemeral X25519 exchange against the member's
//! exchange public key, stretched with HKDF-SHA256 and sealed with
//! AES-256-GCM. Rotation on membership change creates a new version for new
//! writes; earlier versions stay available for reading old content.

use crate::namespace::validate_namespace;
use hkdf::Hkdf;
use meshvault_core::crypto::{open, seal, EncryptionKey, NonceMode, SealedPayload, KEY_SIZE};
use meshvault_core::identity::Identity;
use meshvault_core::{MeshVaultError, Result};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

const WRAP_INFO: &[u8] = b"meshvault group key wrap v1";

/// A member the group key is wrapped for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub member_id: String,
    pub exchange_public_key: [u8; 32],
}

impl GroupMember {
    pub fn new(member_id: impl Into<String>, exchange_public_key: [u8; 32]) -> Self {
        Self {
            member_id: member_id.into(),
            exchange_public_key,
        }
    }

    pub fn from_identity(member_id: impl Into<String>, identity: &Identity) -> Self {
        Self::new(member_id, identity.exchange_public_key())
    }
}

/// Group key sealed to one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub ephemeral_public: [u8; 32],
    pub sealed: SealedPayload,
}

fn wrap_key_material(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Result<EncryptionKey> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(WRAP_INFO, &mut okm)
        .map_err(|e| MeshVaultError::Internal(format!("HKDF expand failed: {e}")))?;
    Ok(EncryptionKey::from_bytes(okm))
}

impl WrappedKey {
    /// Seal `key` so only the holder of `recipient`'s exchange secret can open it.
    /// `aad` binds the wrap to its group and version.
    pub fn wrap(key: &EncryptionKey, recipient: &[u8; 32], aad: &[u8]) -> Result<Self> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));

        let wrap_key = wrap_key_material(shared.as_bytes(), &ephemeral_public, recipient)?;
        let sealed = seal(key.as_bytes(), &wrap_key, aad, NonceMode::Random)?;

        Ok(Self {
            ephemeral_public,
            sealed,
        })
    }

    /// Open with the member's identity
    pub fn unwrap(&self, identity: &Identity, aad: &[u8]) -> Result<EncryptionKey> {
        let shared = identity.diffie_hellman(&self.ephemeral_public);
        let wrap_key =
            wrap_key_material(&shared, &self.ephemeral_public, &identity.exchange_public_key())?;
        let bytes = open(&self.sealed, &wrap_key, aad)?;
        EncryptionKey::from_slice(&bytes)
    }
}

struct GroupKeyVersion {
    key: EncryptionKey,
    wrapped: BTreeMap<String, WrappedKey>,
}

struct GroupState {
    active: u32,
    versions: BTreeMap<u32, GroupKeyVersion>,
}

fn wrap_aad(group_id: &str, version: u32) -> Vec<u8> {
    format!("grp:{group_id}:v{version}").into_bytes()
}

/// Group keys held by the group's administrator node
#[derive(Default)]
pub struct GroupKeyManager {
    groups: RwLock<HashMap<String, GroupState>>,
}

impl GroupKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_version(group_id: &str, version: u32, members: &[GroupMember]) -> Result<GroupKeyVersion> {
        let key = EncryptionKey::generate();
        let aad = wrap_aad(group_id, version);
        let mut wrapped = BTreeMap::new();
        for member in members {
            wrapped.insert(
                member.member_id.clone(),
                WrappedKey::wrap(&key, &member.exchange_public_key, &aad)?,
            );
        }
        Ok(GroupKeyVersion { key, wrapped })
    }

    /// Create a group with version 1 of its key
    pub fn create_group(&self, group_id: &str, members: &[GroupMember]) -> Result<u32> {
        validate_namespace(group_id)?;
        if members.is_empty() {
            return Err(MeshVaultError::Policy(format!(
                "group {group_id} needs at least one member"
            )));
        }

        let mut groups = self.groups.write();
        if groups.contains_key(group_id) {
            return Err(MeshVaultError::Namespace(format!(
                "group {group_id} already exists"
            )));
        }

        let version = Self::new_version(group_id, 1, members)?;
        groups.insert(
            group_id.to_string(),
            GroupState {
                active: 1,
                versions: BTreeMap::from([(1, version)]),
            },
        );

        info!(group_id, members = members.len(), "Created group key");
        Ok(1)
    }

    /// New key version for a changed membership
    pub fn rotate_group(&self, group_id: &str, members: &[GroupMember]) -> Result<u32> {
        if members.is_empty() {
            return Err(MeshVaultError::Policy(format!(
                "group {group_id} needs at least one member"
            )));
        }

        let mut groups = self.groups.write();
        let state = groups
            .get_mut(group_id)
            .ok_or_else(|| MeshVaultError::Namespace(format!("no key for group {group_id}")))?;

        let next = state.active + 1;
        let version = Self::new_version(group_id, next, members)?;
        state.versions.insert(next, version);
        state.active = next;

        info!(group_id, version = next, members = members.len(), "Rotated group key");
        Ok(next)
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.read().contains_key(group_id)
    }

    /// Active key for new writes
    pub fn active_key(&self, group_id: &str) -> Result<(u32, EncryptionKey)> {
        let groups = self.groups.read();
        let state = groups
            .get(group_id)
            .ok_or_else(|| MeshVaultError::Namespace(format!("no key for group {group_id}")))?;
        let version = state.versions.get(&state.active).ok_or_else(|| {
            MeshVaultError::Internal(format!("group {group_id} lost its active key"))
        })?;
        Ok((state.active, version.key.clone()))
    }

    /// Key of a specific version, for reads
    pub fn key_for_version(&self, group_id: &str, version: u32) -> Result<EncryptionKey> {
        let groups = self.groups.read();
        groups
            .get(group_id)
            .and_then(|state| state.versions.get(&version))
            .map(|v| v.key.clone())
            .ok_or_else(|| {
                MeshVaultError::Namespace(format!("no key v{version} for group {group_id}"))
            })
    }

    pub fn active_version(&self, group_id: &str) -> Option<u32> {
        self.groups.read().get(group_id).map(|s| s.active)
    }

    /// Members a version was wrapped for
    pub fn members(&self, group_id: &str, version: u32) -> Vec<String> {
        self.groups
            .read()
            .get(group_id)
            .and_then(|state| state.versions.get(&version))
            .map(|v| v.wrapped.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The wrap a member would receive for a version
    pub fn wrapped_key(&self, group_id: &str, version: u32, member_id: &str) -> Result<WrappedKey> {
        self.groups
            .read()
            .get(group_id)
            .and_then(|state| state.versions.get(&version))
            .and_then(|v| v.wrapped.get(member_id).cloned())
            .ok_or_else(|| {
                MeshVaultError::Namespace(format!(
                    "{member_id} holds no key v{version} for group {group_id}"
                ))
            })
    }

    /// Member-side unwrap of a version (active if `None`)
    pub fn unwrap_for(
        &self,
        group_id: &str,
        version: Option<u32>,
        member_id: &str,
        identity: &Identity,
    ) -> Result<EncryptionKey> {
        let version = match version {
            Some(v) => v,
            None => self.active_version(group_id).ok_or_else(|| {
                MeshVaultError::Namespace(format!("no key for group {group_id}"))
            })?,
        };
        let wrapped = self.wrapped_key(group_id, version, member_id)?;
        wrapped.unwrap(identity, &wrap_aad(group_id, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> (Vec<Identity>, Vec<GroupMember>) {
        let identities: Vec<Identity> = (0..n).map(|_| Identity::generate()).collect();
        let members = identities
            .iter()
            .enumerate()
            .map(|(i, id)| GroupMember::from_identity(format!("m{i}"), id))
            .collect();
        (identities, members)
    }

    #[test]
    fn test_members_unwrap_same_key() {
        let manager = GroupKeyManager::new();
        let (ids, group) = members(3);
        manager.create_group("team", &group).unwrap();

        let (_, active) = manager.active_key("team").unwrap();
        for (i, id) in ids.iter().enumerate() {
            let key = manager.unwrap_for("team", None, &format!("m{i}"), id).unwrap();
            assert_eq!(key, active);
        }
    }

    #[test]
    fn test_wrong_identity_cannot_unwrap() {
        let manager = GroupKeyManager::new();
        let (_, group) = members(2);
        manager.create_group("team", &group).unwrap();

        let outsider = Identity::generate();
        assert!(manager.unwrap_for("team", None, "m0", &outsider).is_err());
        assert!(manager.unwrap_for("team", None, "m9", &outsider).is_err());
    }

    #[test]
    fn test_wrap_bound_to_version() {
        let identity = Identity::generate();
        let key = EncryptionKey::generate();
        let wrapped =
            WrappedKey::wrap(&key, &identity.exchange_public_key(), &wrap_aad("g", 1)).unwrap();
        assert_eq!(wrapped.unwrap(&identity, &wrap_aad("g", 1)).unwrap(), key);
        assert!(wrapped.unwrap(&identity, &wrap_aad("g", 2)).is_err());
    }

    #[test]
    fn test_rotation_on_membership_change() {
        let manager = GroupKeyManager::new();
        let (ids, group) = members(3);
        manager.create_group("team", &group).unwrap();
        let (_, v1_key) = manager.active_key("team").unwrap();

        // m2 leaves
        let v2 = manager.rotate_group("team", &group[..2]).unwrap();
        assert_eq!(v2, 2);
        let (active, v2_key) = manager.active_key("team").unwrap();
        assert_eq!(active, 2);
        assert_ne!(v1_key, v2_key);

        assert!(manager.unwrap_for("team", Some(2), "m2", &ids[2]).is_err());
        assert_eq!(manager.unwrap_for("team", Some(1), "m2", &ids[2]).unwrap(), v1_key);
        assert_eq!(manager.key_for_version("team", 1).unwrap(), v1_key);
        assert_eq!(manager.members("team", 2), vec!["m0".to_string(), "m1".to_string()]);
    }

    #[test]
    fn test_create_errors() {
        let manager = GroupKeyManager::new();
        let (_, group) = members(1);
        assert!(manager.create_group("team", &[]).is_err());
        assert!(manager.create_group("bad-id", &group).is_err());
        manager.create_group("team", &group).unwrap();
        assert!(matches!(
            manager.create_group("team", &group),
            Err(MeshVaultError::Namespace(_))
        ));
        assert!(manager.rotate_group("missing", &group).is_err());
        assert!(manager.active_key("missing").is_err());
    }
}
