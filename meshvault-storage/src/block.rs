//! Encrypted, signed blocks
//!
//! Wire shape (JSON, camelCase, binary fields hex encoded):
//!
//! ```json
//! {
//!   "ciphertext": "…", "nonce": "…", "authTag": "…",
//!   "signature": "…", "keyId": "ns:notes:v1:file", "publicKey": "…",
//!   "metadata": { "size": 12, "createdAt": "…", "mimeType": "text/plain" }
//! }
//! ```
//!
//! Backends store the same structure with bincode, so every field is always
//! serialized (absent options appear as `null` in JSON).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use meshvault_core::crypto::{signing_bytes, SealedPayload, NONCE_SIZE, TAG_SIZE};
use meshvault_core::identity::verify_signature;
use meshvault_core::{BlockId, Result};
use meshvault_keys::KeyId;
use serde::{Deserialize, Serialize};

pub(crate) mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(value))
        } else {
            serializer.serialize_bytes(value.as_ref())
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let bytes = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(D::Error::custom)?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };
        T::try_from(bytes).map_err(|_| D::Error::custom("unexpected byte length"))
    }
}

/// Optional descriptive fields carried next to a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    /// Plaintext length in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Shard index when the block holds an erasure-coded shard
    #[serde(default)]
    pub erasure_index: Option<u32>,
    /// Identity the block is being forwarded on behalf of
    #[serde(default)]
    pub forward_identity: Option<String>,
}

impl BlockMetadata {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            created_at: Utc::now(),
            mime_type: None,
            erasure_index: None,
            forward_identity: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_erasure_index(mut self, index: u32) -> Self {
        self.erasure_index = Some(index);
        self
    }

    pub fn with_forward_identity(mut self, identity: impl Into<String>) -> Self {
        self.forward_identity = Some(identity.into());
        self
    }
}

/// A sealed block as stored and transmitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlock {
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "hex_bytes")]
    pub auth_tag: [u8; TAG_SIZE],
    /// Ed25519 signature over `ciphertext || nonce || authTag`
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub key_id: KeyId,
    /// Signer's Ed25519 public key
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub metadata: Option<BlockMetadata>,
}

impl EncryptedBlock {
    /// Ciphertext, nonce and tag in the form the AEAD layer opens
    pub fn sealed(&self) -> SealedPayload {
        SealedPayload {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce,
            auth_tag: self.auth_tag,
        }
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(&self.ciphertext, &self.nonce, &self.auth_tag)
    }

    /// Address of a ciphertext-addressed block
    pub fn sealed_address(&self) -> BlockId {
        BlockId::from_data(&self.signing_bytes())
    }

    /// Check the signature; `id` names the block in the error
    pub fn verify_signature(&self, id: &BlockId) -> Result<()> {
        verify_signature(
            &self.public_key,
            &self.signing_bytes(),
            &self.signature,
            &id.to_hex(),
        )
    }

    /// Stored size of the sealed payload
    pub fn size(&self) -> usize {
        self.ciphertext.len() + NONCE_SIZE + TAG_SIZE
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvault_core::crypto::{seal, EncryptionKey, NonceMode};
    use meshvault_core::identity::Identity;
    use meshvault_core::MeshVaultError;
    use meshvault_keys::KeyContext;

    fn signed_block() -> (EncryptedBlock, BlockId) {
        let identity = Identity::generate();
        let key = EncryptionKey::generate();
        let key_id = KeyId::External {
            context: KeyContext::File,
        };
        let sealed = seal(b"hello block", &key, key_id.to_string().as_bytes(), NonceMode::Random)
            .unwrap();
        let block = EncryptedBlock {
            signature: identity.sign(&sealed.signing_bytes()).to_vec(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            auth_tag: sealed.auth_tag,
            key_id,
            public_key: identity.public_key().to_vec(),
            metadata: Some(BlockMetadata::new(11).with_mime_type("text/plain")),
        };
        let id = block.sealed_address();
        (block, id)
    }

    #[test]
    fn test_json_wire_shape() {
        let (block, _) = signed_block();
        let json: serde_json::Value = serde_json::from_str(&block.to_json().unwrap()).unwrap();

        for field in ["ciphertext", "nonce", "authTag", "signature", "keyId", "publicKey"] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert_eq!(json["nonce"].as_str().unwrap().len(), NONCE_SIZE * 2);
        assert_eq!(json["keyId"], "ext:file");
        assert_eq!(json["metadata"]["mimeType"], "text/plain");
        assert!(json["metadata"]["erasureIndex"].is_null());

        let back = EncryptedBlock::from_json(&block.to_json().unwrap()).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_bincode_roundtrip() {
        let (block, _) = signed_block();
        let back = EncryptedBlock::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_single_bit_flips_break_signature() {
        let (block, id) = signed_block();
        block.verify_signature(&id).unwrap();

        let mut flipped = block.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert!(matches!(
            flipped.verify_signature(&id),
            Err(MeshVaultError::SignatureInvalid(_))
        ));

        let mut flipped = block.clone();
        flipped.nonce[NONCE_SIZE - 1] ^= 0x80;
        assert!(flipped.verify_signature(&id).is_err());

        let mut flipped = block;
        flipped.auth_tag[3] ^= 0x10;
        assert!(flipped.verify_signature(&id).is_err());
    }

    #[test]
    fn test_rejects_bad_hex_lengths() {
        let (block, _) = signed_block();
        let mut json: serde_json::Value = serde_json::from_str(&block.to_json().unwrap()).unwrap();
        json["nonce"] = serde_json::Value::String("abcd".to_string());
        assert!(EncryptedBlock::from_json(&json.to_string()).is_err());
    }
}
