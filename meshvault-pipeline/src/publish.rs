//! Versioned public markdown
//!
//! Published documents use the public convergent policy, so identical text
//! maps to the same block from any member and anyone can read it back.

use crate::manifest::{next_patch_version, INITIAL_VERSION};
use chrono::{DateTime, Utc};
use meshvault_core::chunk::BlockId;
use meshvault_core::crypto::ContentHash;
use meshvault_core::{MeshVaultError, Result};
use meshvault_keys::{KeyContext, StoragePolicy};
use meshvault_storage::{BlockMetadata, ContentStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    pub block_id: BlockId,
    pub checksum: ContentHash,
    pub size: u64,
    pub published_at: DateTime<Utc>,
}

/// Publishes markdown documents through one member's store
pub struct Publisher {
    store: Arc<ContentStore>,
    releases: RwLock<HashMap<String, Vec<Publication>>>,
}

impl Publisher {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self {
            store,
            releases: RwLock::new(HashMap::new()),
        }
    }

    /// Publish `markdown` under `name`
    ///
    /// The first release is `1.0.0`; changed text bumps the patch version and
    /// links the previous one. Unchanged text returns the current release.
    pub async fn publish(&self, name: &str, markdown: &str) -> Result<Publication> {
        if name.trim().is_empty() {
            return Err(MeshVaultError::Policy(
                "publication name cannot be empty".to_string(),
            ));
        }

        let checksum = ContentHash::compute(markdown.as_bytes());
        let current = self.latest(name);
        if let Some(current) = &current {
            if current.checksum == checksum {
                debug!(name, version = %current.version, "Content unchanged, nothing to publish");
                return Ok(current.clone());
            }
        }

        let metadata =
            BlockMetadata::new(markdown.len() as u64).with_mime_type("text/markdown");
        let block_id = self
            .store
            .put_with_policy(
                markdown.as_bytes(),
                &StoragePolicy::PublicMarkdown,
                KeyContext::File,
                Some(metadata),
            )
            .await?;

        let (version, previous_version) = match &current {
            Some(current) => (
                next_patch_version(&current.version)?,
                Some(current.version.clone()),
            ),
            None => (INITIAL_VERSION.to_string(), None),
        };
        let publication = Publication {
            name: name.to_string(),
            version,
            previous_version,
            block_id,
            checksum,
            size: markdown.len() as u64,
            published_at: Utc::now(),
        };

        let mut releases = self.releases.write();
        let history = releases.entry(name.to_string()).or_default();
        if history.last().map(|p| &p.version) != current.as_ref().map(|p| &p.version) {
            return Err(MeshVaultError::VersionMismatch(format!(
                "{name} was published concurrently"
            )));
        }
        history.push(publication.clone());
        info!(name, version = %publication.version, block_id = %block_id, "Published");
        Ok(publication)
    }

    pub fn latest(&self, name: &str) -> Option<Publication> {
        self.releases.read().get(name).and_then(|h| h.last().cloned())
    }

    /// Every release of `name`, oldest first
    pub fn history(&self, name: &str) -> Vec<Publication> {
        self.releases.read().get(name).cloned().unwrap_or_default()
    }

    /// Text of a release; the latest when `version` is `None`
    pub async fn fetch(&self, name: &str, version: Option<&str>) -> Result<String> {
        let publication = {
            let releases = self.releases.read();
            let history = releases
                .get(name)
                .ok_or_else(|| MeshVaultError::NotFound(format!("publication {name}")))?;
            let found = match version {
                Some(v) => history.iter().find(|p| p.version == v),
                None => history.last(),
            };
            found.cloned().ok_or_else(|| {
                MeshVaultError::NotFound(format!("{name} {}", version.unwrap_or("latest")))
            })?
        };
        read(&self.store, &publication).await
    }
}

/// Read a publication through any store on the network
pub async fn read(store: &ContentStore, publication: &Publication) -> Result<String> {
    let bytes = store.get(&publication.block_id, None).await?;
    if !publication.checksum.verify(&bytes) {
        return Err(MeshVaultError::VersionMismatch(format!(
            "{} {} does not match its checksum",
            publication.name, publication.version
        )));
    }
    String::from_utf8(bytes).map_err(|e| MeshVaultError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_core::identity::Identity;
    use meshvault_keys::{MasterKey, PolicyEngine};
    use meshvault_storage::{PeerNetwork, StoreConfig};

    fn publisher() -> Publisher {
        let store = ContentStore::join(
            PeerNetwork::new(),
            Arc::new(Identity::generate()),
            Arc::new(PolicyEngine::new(MasterKey::generate()).unwrap()),
            StoreConfig::default(),
        )
        .unwrap();
        Publisher::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_version_chain() {
        let publisher = publisher();
        let v1 = publisher.publish("guide", "# Guide\n").await.unwrap();
        assert_eq!(v1.version, "1.0.0");
        assert!(v1.previous_version.is_none());

        let same = publisher.publish("guide", "# Guide\n").await.unwrap();
        assert_eq!(same, v1);

        let v2 = publisher.publish("guide", "# Guide\n\nMore.\n").await.unwrap();
        assert_eq!(v2.version, "1.0.1");
        assert_eq!(v2.previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(publisher.history("guide").len(), 2);

        assert_eq!(publisher.fetch("guide", Some("1.0.0")).await.unwrap(), "# Guide\n");
        assert_eq!(publisher.fetch("guide", None).await.unwrap(), "# Guide\n\nMore.\n");
        assert!(matches!(
            publisher.fetch("guide", Some("9.9.9")).await,
            Err(MeshVaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        assert!(publisher().publish("  ", "text").await.is_err());
    }
}
