//! Versioned namespace keys
//!
//! Version 1 of a namespace key is created the first time the namespace is
//! used. Rotation appends a new version and moves the active pointer under a
//! write lock, so concurrent rotations each produce a distinct version and
//! no earlier key is lost. Old versions stay readable until `cleanup`.

use crate::derivation::{derive_namespace_key, MasterKey};
use crate::namespace::validate_namespace;
use meshvault_core::crypto::EncryptionKey;
use meshvault_core::{MeshVaultError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

struct NamespaceEntry {
    active: u32,
    keys: BTreeMap<u32, EncryptionKey>,
}

/// Namespace key store for one master key and scope
pub struct NamespaceKeyring {
    master: Arc<MasterKey>,
    scope: String,
    entries: RwLock<HashMap<String, NamespaceEntry>>,
}

impl NamespaceKeyring {
    pub fn new(master: Arc<MasterKey>, scope: impl Into<String>) -> Self {
        Self {
            master,
            scope: scope.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Active key and its version, creating version 1 on first use
    pub fn active_key(&self, namespace: &str) -> Result<(u32, EncryptionKey)> {
        validate_namespace(namespace)?;

        if let Some(entry) = self.entries.read().get(namespace) {
            if let Some(key) = entry.keys.get(&entry.active) {
                return Ok((entry.active, key.clone()));
            }
        }

        let mut entries = self.entries.write();
        if !entries.contains_key(namespace) {
            let key = derive_namespace_key(&self.master, namespace, &self.scope, 1)?;
            debug!(namespace, scope = %self.scope, "Created namespace key v1");
            entries.insert(
                namespace.to_string(),
                NamespaceEntry {
                    active: 1,
                    keys: BTreeMap::from([(1, key)]),
                },
            );
        }

        let entry = entries
            .get(namespace)
            .ok_or_else(|| MeshVaultError::Internal("namespace entry vanished".to_string()))?;
        let key = entry.keys.get(&entry.active).ok_or_else(|| {
            MeshVaultError::Namespace(format!("active key for {namespace} was purged"))
        })?;
        Ok((entry.active, key.clone()))
    }

    /// Key of a specific version, for reading older content
    pub fn key_for_version(&self, namespace: &str, version: u32) -> Result<EncryptionKey> {
        validate_namespace(namespace)?;

        let found = {
            let entries = self.entries.read();
            entries
                .get(namespace)
                .map(|entry| (entry.active, entry.keys.get(&version).cloned()))
        };

        match found {
            Some((_, Some(key))) => Ok(key),
            Some((active, None)) if version > active => Err(MeshVaultError::Namespace(format!(
                "{namespace} has no key v{version} (active v{active})"
            ))),
            Some((_, None)) => Err(MeshVaultError::Namespace(format!(
                "{namespace} key v{version} was removed by cleanup"
            ))),
            // Unused namespaces are still readable at v1 since it is derivable
            None if version == 1 => self.active_key(namespace).map(|(_, key)| key),
            None => Err(MeshVaultError::Namespace(format!(
                "{namespace} has no key v{version}"
            ))),
        }
    }

    /// Rotate to a new version and return it
    pub fn rotate(&self, namespace: &str) -> Result<u32> {
        validate_namespace(namespace)?;

        let mut entries = self.entries.write();
        let next = match entries.get(namespace) {
            Some(entry) => entry.active + 1,
            None => 2,
        };

        let mut new_keys = BTreeMap::new();
        if !entries.contains_key(namespace) {
            new_keys.insert(1, derive_namespace_key(&self.master, namespace, &self.scope, 1)?);
        }
        let key = derive_namespace_key(&self.master, namespace, &self.scope, next)?;

        let entry = entries
            .entry(namespace.to_string())
            .or_insert_with(|| NamespaceEntry {
                active: 1,
                keys: BTreeMap::new(),
            });
        entry.keys.append(&mut new_keys);
        entry.keys.insert(next, key);
        entry.active = next;

        info!(namespace, version = next, "Rotated namespace key");
        Ok(next)
    }

    /// Active version, if the namespace has been used
    pub fn active_version(&self, namespace: &str) -> Option<u32> {
        self.entries.read().get(namespace).map(|e| e.active)
    }

    /// Versions currently held, oldest first
    pub fn versions(&self, namespace: &str) -> Vec<u32> {
        self.entries
            .read()
            .get(namespace)
            .map(|e| e.keys.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drop all but the newest `retain` versions. The active version is always
    /// kept. Returns how many versions were removed.
    pub fn cleanup(&self, namespace: &str, retain: usize) -> usize {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(namespace) else {
            return 0;
        };

        let retain = retain.max(1);
        let doomed: Vec<u32> = entry
            .keys
            .keys()
            .rev()
            .skip(retain)
            .copied()
            .filter(|v| *v != entry.active)
            .collect();
        for version in &doomed {
            entry.keys.remove(version);
        }

        if !doomed.is_empty() {
            info!(namespace, removed = doomed.len(), "Cleaned up namespace keys");
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring() -> NamespaceKeyring {
        NamespaceKeyring::new(Arc::new(MasterKey::from_bytes([11u8; 32])), "private")
    }

    #[test]
    fn test_lazy_creation() {
        let ring = keyring();
        assert_eq!(ring.active_version("notes"), None);

        let (version, key) = ring.active_key("notes").unwrap();
        assert_eq!(version, 1);
        assert_eq!(ring.active_version("notes"), Some(1));
        assert_eq!(ring.active_key("notes").unwrap().1, key);
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let ring = keyring();
        assert!(matches!(
            ring.active_key("root"),
            Err(MeshVaultError::Namespace(_))
        ));
        assert!(ring.rotate("bad name").is_err());
    }

    #[test]
    fn test_rotation_keeps_history() {
        let ring = keyring();
        let (_, v1) = ring.active_key("notes").unwrap();

        assert_eq!(ring.rotate("notes").unwrap(), 2);
        let (version, v2) = ring.active_key("notes").unwrap();
        assert_eq!(version, 2);
        assert_ne!(v1, v2);
        assert_eq!(ring.key_for_version("notes", 1).unwrap(), v1);
        assert!(ring.key_for_version("notes", 3).is_err());
    }

    #[test]
    fn test_rotate_unused_namespace() {
        let ring = keyring();
        assert_eq!(ring.rotate("fresh").unwrap(), 2);
        assert_eq!(ring.versions("fresh"), vec![1, 2]);
    }

    #[test]
    fn test_same_master_same_keys() {
        let a = keyring();
        let b = keyring();
        a.rotate("notes").unwrap();
        b.rotate("notes").unwrap();
        assert_eq!(
            a.key_for_version("notes", 2).unwrap(),
            b.key_for_version("notes", 2).unwrap()
        );
    }

    #[test]
    fn test_cleanup() {
        let ring = keyring();
        for _ in 0..4 {
            ring.rotate("notes").unwrap();
        }
        assert_eq!(ring.versions("notes"), vec![1, 2, 3, 4, 5]);

        assert_eq!(ring.cleanup("notes", 2), 3);
        assert_eq!(ring.versions("notes"), vec![4, 5]);
        assert!(ring.key_for_version("notes", 1).is_err());
        assert!(ring.key_for_version("notes", 4).is_ok());

        // Active version survives even with retain = 0
        assert_eq!(ring.cleanup("notes", 0), 1);
        assert_eq!(ring.versions("notes"), vec![5]);
        assert_eq!(ring.cleanup("unknown", 1), 0);
    }
}
