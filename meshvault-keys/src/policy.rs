//! Storage policies
//!
//! A policy decides how a block is keyed, how its nonce is chosen, and how far
//! identical content deduplicates. Policies are ordered by exposure:
//!
//! | Policy          | Encryption   | Dedup scope | Sharing |
//! |-----------------|--------------|-------------|---------|
//! | PrivateMax      | random       | none        | no      |
//! | PrivateScoped   | deterministic| namespace   | no      |
//! | GroupScoped     | deterministic| group       | yes     |
//! | PublicMarkdown  | convergent   | global      | yes     |

use crate::namespace::validate_namespace;
use meshvault_core::{MeshVaultError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the per-block key and nonce are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    /// Fresh key material and nonce per write
    Random,
    /// Key and nonce fixed by scope and content
    Deterministic,
    /// Key derived from the content itself
    Convergent,
}

/// How far identical plaintext collapses onto one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupScope {
    None,
    Namespace,
    Group,
    Global,
}

/// Policy applied to a write
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StoragePolicy {
    PrivateMax,
    PrivateScoped {
        namespace: String,
    },
    GroupScoped {
        #[serde(rename = "groupId")]
        group_id: String,
    },
    PublicMarkdown,
}

/// Flat, serializable view of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDescriptor {
    #[serde(rename = "type")]
    pub policy_type: String,
    pub encryption_mode: EncryptionMode,
    pub deduplication_scope: DedupScope,
    pub allow_sharing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub audit_required: bool,
}

impl StoragePolicy {
    pub fn private_scoped(namespace: impl Into<String>) -> Self {
        Self::PrivateScoped {
            namespace: namespace.into(),
        }
    }

    pub fn group_scoped(group_id: impl Into<String>) -> Self {
        Self::GroupScoped {
            group_id: group_id.into(),
        }
    }

    /// Short policy name used in identifiers
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrivateMax => "private-max",
            Self::PrivateScoped { .. } => "private-scoped",
            Self::GroupScoped { .. } => "group-scoped",
            Self::PublicMarkdown => "public-markdown",
        }
    }

    pub fn encryption_mode(&self) -> EncryptionMode {
        match self {
            Self::PrivateMax => EncryptionMode::Random,
            Self::PrivateScoped { .. } | Self::GroupScoped { .. } => EncryptionMode::Deterministic,
            Self::PublicMarkdown => EncryptionMode::Convergent,
        }
    }

    pub fn dedup_scope(&self) -> DedupScope {
        match self {
            Self::PrivateMax => DedupScope::None,
            Self::PrivateScoped { .. } => DedupScope::Namespace,
            Self::GroupScoped { .. } => DedupScope::Group,
            Self::PublicMarkdown => DedupScope::Global,
        }
    }

    pub fn allows_sharing(&self) -> bool {
        matches!(self, Self::GroupScoped { .. } | Self::PublicMarkdown)
    }

    pub fn audit_required(&self) -> bool {
        matches!(self, Self::PublicMarkdown)
    }

    /// Exposure rank, 0 (most private) to 3 (public)
    pub fn exposure(&self) -> u8 {
        match self {
            Self::PrivateMax => 0,
            Self::PrivateScoped { .. } => 1,
            Self::GroupScoped { .. } => 2,
            Self::PublicMarkdown => 3,
        }
    }

    /// Check that required parameters are present and well formed
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::PrivateScoped { namespace } => validate_namespace(namespace),
            Self::GroupScoped { group_id } => validate_namespace(group_id).map_err(|e| {
                MeshVaultError::Policy(format!("invalid group id {group_id:?}: {e}"))
            }),
            Self::PrivateMax | Self::PublicMarkdown => Ok(()),
        }
    }

    /// Reject content the policy cannot carry
    pub fn validate_content(&self, plaintext: &[u8]) -> Result<()> {
        if let Self::PublicMarkdown = self {
            std::str::from_utf8(plaintext).map_err(|e| {
                MeshVaultError::Policy(format!("public-markdown content must be UTF-8 text: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn descriptor(&self) -> PolicyDescriptor {
        let (namespace, group_id) = match self {
            Self::PrivateScoped { namespace } => (Some(namespace.clone()), None),
            Self::GroupScoped { group_id } => (None, Some(group_id.clone())),
            Self::PrivateMax | Self::PublicMarkdown => (None, None),
        };
        PolicyDescriptor {
            policy_type: self.name().to_string(),
            encryption_mode: self.encryption_mode(),
            deduplication_scope: self.dedup_scope(),
            allow_sharing: self.allows_sharing(),
            namespace,
            group_id,
            audit_required: self.audit_required(),
        }
    }
}

impl TryFrom<PolicyDescriptor> for StoragePolicy {
    type Error = MeshVaultError;

    fn try_from(descriptor: PolicyDescriptor) -> Result<Self> {
        let policy = match (descriptor.policy_type.as_str(), descriptor.namespace, descriptor.group_id) {
            ("private-max", None, None) => Self::PrivateMax,
            ("private-scoped", Some(namespace), None) => Self::PrivateScoped { namespace },
            ("group-scoped", None, Some(group_id)) => Self::GroupScoped { group_id },
            ("public-markdown", None, None) => Self::PublicMarkdown,
            (other, namespace, group_id) => {
                return Err(MeshVaultError::Policy(format!(
                    "descriptor {other:?} with namespace={namespace:?} group_id={group_id:?} is not a valid policy"
                )))
            }
        };

        // Derived fields must agree with the type
        let expected = policy.descriptor();
        if expected.encryption_mode != descriptor.encryption_mode
            || expected.deduplication_scope != descriptor.deduplication_scope
            || expected.allow_sharing != descriptor.allow_sharing
            || expected.audit_required != descriptor.audit_required
        {
            return Err(MeshVaultError::Policy(format!(
                "descriptor fields disagree with policy type {}",
                policy.name()
            )));
        }

        policy.validate()?;
        Ok(policy)
    }
}

impl fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateScoped { namespace } => write!(f, "private-scoped:{namespace}"),
            Self::GroupScoped { group_id } => write!(f, "group-scoped:{group_id}"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for StoragePolicy {
    type Err = MeshVaultError;

    fn from_str(s: &str) -> Result<Self> {
        let policy = match s.split_once(':') {
            None if s == "private-max" => Self::PrivateMax,
            None if s == "public-markdown" => Self::PublicMarkdown,
            Some(("private-scoped", ns)) => Self::private_scoped(ns),
            Some(("group-scoped", group)) => Self::group_scoped(group),
            None if s == "private-scoped" || s == "group-scoped" => {
                return Err(MeshVaultError::Policy(format!(
                    "policy {s} requires a parameter, e.g. {s}:<name>"
                )))
            }
            _ => return Err(MeshVaultError::Policy(format!("unknown policy {s:?}"))),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Outcome of an allowed policy change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from: StoragePolicy,
    pub to: StoragePolicy,
    /// Content must be re-encrypted under the new policy
    pub requires_reencryption: bool,
    /// The re-encrypted content lands at a new address
    pub new_address: bool,
}

/// Decide whether content stored under `from` may move to `to`.
///
/// Widening exposure is allowed and re-encrypts. Once content has been
/// shared (group or public), it cannot move to a narrower policy. Switching
/// namespace or group at the same exposure is a re-key.
pub fn validate_transition(from: &StoragePolicy, to: &StoragePolicy) -> Result<TransitionPlan> {
    from.validate()?;
    to.validate()?;

    if from == to {
        return Ok(TransitionPlan {
            from: from.clone(),
            to: to.clone(),
            requires_reencryption: false,
            new_address: false,
        });
    }

    if from.allows_sharing() && to.exposure() < from.exposure() {
        return Err(MeshVaultError::Policy(format!(
            "cannot narrow {from} to {to}: content has already been shared"
        )));
    }

    Ok(TransitionPlan {
        from: from.clone(),
        to: to.clone(),
        requires_reencryption: true,
        new_address: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for s in [
            "private-max",
            "private-scoped:alice_notes",
            "group-scoped:team_7",
            "public-markdown",
        ] {
            let policy: StoragePolicy = s.parse().unwrap();
            assert_eq!(policy.to_string(), s);
        }
        assert!("private-scoped".parse::<StoragePolicy>().is_err());
        assert!("private-scoped:admin".parse::<StoragePolicy>().is_err());
        assert!("group-scoped:has space".parse::<StoragePolicy>().is_err());
        assert!("secret".parse::<StoragePolicy>().is_err());
    }

    #[test]
    fn test_descriptor_fields() {
        let d = StoragePolicy::PublicMarkdown.descriptor();
        assert_eq!(d.encryption_mode, EncryptionMode::Convergent);
        assert_eq!(d.deduplication_scope, DedupScope::Global);
        assert!(d.allow_sharing);
        assert!(d.audit_required);

        let d = StoragePolicy::private_scoped("notes").descriptor();
        assert_eq!(d.namespace.as_deref(), Some("notes"));
        assert!(d.group_id.is_none());
        assert!(!d.allow_sharing);
    }

    #[test]
    fn test_descriptor_json_roundtrip() {
        let policy = StoragePolicy::group_scoped("team");
        let json = serde_json::to_value(policy.descriptor()).unwrap();
        assert_eq!(json["type"], "group-scoped");
        assert_eq!(json["groupId"], "team");
        assert_eq!(json["deduplicationScope"], "group");

        let descriptor: PolicyDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(StoragePolicy::try_from(descriptor).unwrap(), policy);
    }

    #[test]
    fn test_descriptor_missing_parameter() {
        let mut d = StoragePolicy::private_scoped("notes").descriptor();
        d.namespace = None;
        assert!(matches!(
            StoragePolicy::try_from(d),
            Err(MeshVaultError::Policy(_))
        ));

        let mut d = StoragePolicy::PrivateMax.descriptor();
        d.allow_sharing = true;
        assert!(StoragePolicy::try_from(d).is_err());
    }

    #[test]
    fn test_policy_enum_serde_tagged() {
        let json = serde_json::to_string(&StoragePolicy::group_scoped("g1")).unwrap();
        assert_eq!(json, r#"{"type":"group-scoped","groupId":"g1"}"#);
        let back: StoragePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StoragePolicy::group_scoped("g1"));
    }

    #[test]
    fn test_public_markdown_requires_text() {
        let policy = StoragePolicy::PublicMarkdown;
        assert!(policy.validate_content("# Title\n\nbody".as_bytes()).is_ok());
        assert!(matches!(
            policy.validate_content(&[0xff, 0xfe, 0x00]),
            Err(MeshVaultError::Policy(_))
        ));
        assert!(StoragePolicy::PrivateMax.validate_content(&[0xff]).is_ok());
    }

    #[test]
    fn test_widening_forces_reencryption() {
        let plan = validate_transition(
            &StoragePolicy::private_scoped("notes"),
            &StoragePolicy::group_scoped("team"),
        )
        .unwrap();
        assert!(plan.requires_reencryption);
        assert!(plan.new_address);

        let plan =
            validate_transition(&StoragePolicy::group_scoped("team"), &StoragePolicy::PublicMarkdown)
                .unwrap();
        assert!(plan.requires_reencryption);
    }

    #[test]
    fn test_narrowing_shared_content_rejected() {
        for (from, to) in [
            (StoragePolicy::group_scoped("team"), StoragePolicy::PrivateMax),
            (StoragePolicy::group_scoped("team"), StoragePolicy::private_scoped("n")),
            (StoragePolicy::PublicMarkdown, StoragePolicy::group_scoped("team")),
            (StoragePolicy::PublicMarkdown, StoragePolicy::PrivateMax),
        ] {
            assert!(matches!(
                validate_transition(&from, &to),
                Err(MeshVaultError::Policy(_))
            ));
        }
    }

    #[test]
    fn test_rekey_and_noop() {
        let plan = validate_transition(
            &StoragePolicy::group_scoped("a"),
            &StoragePolicy::group_scoped("b"),
        )
        .unwrap();
        assert!(plan.requires_reencryption);

        let same = StoragePolicy::private_scoped("notes");
        let plan = validate_transition(&same, &same).unwrap();
        assert!(!plan.requires_reencryption);
        assert!(!plan.new_address);
    }
}
