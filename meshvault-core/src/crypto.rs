//! Cryptographic primitives for MeshVault
//!
//! Provides:
//! - Blake3 content hashing (fast, parallelizable)
//! - AES-256-GCM sealing with a detached authentication tag
//! - Random or deterministic (synthetic) nonces
//! - Key derivation from passphrases using Argon2

use crate::error::{MeshVaultError, Result};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256-GCM key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Payloads above this size are hashed with rayon
const PARALLEL_HASH_THRESHOLD: usize = 1024 * 1024;

const SYNTHETIC_NONCE_DOMAIN: &[u8] = b"meshvault-synthetic-nonce-v1";

/// Blake3 hash wrapper for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        if data.len() > PARALLEL_HASH_THRESHOLD {
            return Self::compute_parallel(data);
        }
        Self(blake3::hash(data))
    }

    /// Compute Blake3 hash of data using multiple threads (for large data)
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(hasher.finalize())
    }

    /// Wrap raw hash bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| MeshVaultError::InvalidBlockId(e.to_string()))?;
        Ok(Self(hash))
    }

    /// Verify that data matches this hash (constant time comparison)
    pub fn verify(&self, data: &[u8]) -> bool {
        let computed = Self::compute(data);
        self.0 == computed.0
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(self.as_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let hex: String = Deserialize::deserialize(deserializer)?;
            return ContentHash::from_hex(&hex).map_err(serde::de::Error::custom);
        }
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid hash length"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self::from_bytes(arr))
    }
}

/// AES-256-GCM encryption key, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(MeshVaultError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    /// Derive key from password using Argon2
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> Result<Self> {
        use argon2::password_hash::SaltString;
        use argon2::{Argon2, PasswordHasher};

        if password.is_empty() {
            return Err(MeshVaultError::Encryption("empty password".to_string()));
        }

        // Create salt string (must be base64-encoded)
        let salt_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD_NO_PAD, salt);
        let salt_string = SaltString::from_b64(&salt_b64)
            .map_err(|e| MeshVaultError::Encryption(e.to_string()))?;

        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password, &salt_string)
            .map_err(|e| MeshVaultError::Encryption(e.to_string()))?;

        let hash_bytes = password_hash
            .hash
            .ok_or_else(|| MeshVaultError::Encryption("No hash output".to_string()))?;

        Self::from_slice(hash_bytes.as_bytes())
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// How the nonce for a seal operation is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonceMode {
    /// Fresh random nonce per call; identical plaintext never repeats ciphertext
    Random,
    /// Nonce derived from key, associated data and plaintext; identical input
    /// yields identical ciphertext
    Synthetic,
}

/// Output of [`seal`]: ciphertext with its nonce and detached tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub auth_tag: [u8; TAG_SIZE],
}

impl SealedPayload {
    /// Bytes covered by a block signature: `ciphertext || nonce || tag`
    pub fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(&self.ciphertext, &self.nonce, &self.auth_tag)
    }
}

/// Concatenate the authenticated parts of a sealed payload
pub fn signing_bytes(ciphertext: &[u8], nonce: &[u8], auth_tag: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ciphertext.len() + nonce.len() + auth_tag.len());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(nonce);
    out.extend_from_slice(auth_tag);
    out
}

/// Nonce derived with keyed Blake3 over associated data and plaintext
pub fn synthetic_nonce(key: &EncryptionKey, aad: &[u8], plaintext: &[u8]) -> [u8; NONCE_SIZE] {
    let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
    hasher.update(SYNTHETIC_NONCE_DOMAIN);
    hasher.update(&(aad.len() as u64).to_le_bytes());
    hasher.update(aad);
    hasher.update(plaintext);
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_SIZE]);
    nonce
}

/// Encrypt with AES-256-GCM, binding `aad`, returning a detached tag
pub fn seal(
    plaintext: &[u8],
    key: &EncryptionKey,
    aad: &[u8],
    mode: NonceMode,
) -> Result<SealedPayload> {
    let nonce_bytes = match mode {
        NonceMode::Random => {
            use rand::RngCore;
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            nonce
        }
        NonceMode::Synthetic => synthetic_nonce(key, aad, plaintext),
    };

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| MeshVaultError::Encryption(e.to_string()))?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), aad, &mut buffer)
        .map_err(|e| MeshVaultError::Encryption(e.to_string()))?;

    let mut auth_tag = [0u8; TAG_SIZE];
    auth_tag.copy_from_slice(tag.as_slice());

    Ok(SealedPayload {
        ciphertext: buffer,
        nonce: nonce_bytes,
        auth_tag,
    })
}

/// Decrypt and authenticate a sealed payload
pub fn open(sealed: &SealedPayload, key: &EncryptionKey, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| MeshVaultError::Decryption(e.to_string()))?;

    let mut buffer = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            &mut buffer,
            Tag::from_slice(&sealed.auth_tag),
        )
        .map_err(|_| MeshVaultError::Decryption("Authentication failed".to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let data = b"hello world";
        let hash = ContentHash::compute(data);

        // Same data produces same hash
        let hash2 = ContentHash::compute(data);
        assert_eq!(hash, hash2);

        // Different data produces different hash
        let hash3 = ContentHash::compute(b"different data");
        assert_ne!(hash, hash3);

        assert!(hash.verify(data));
        assert!(!hash.verify(b"wrong data"));
    }

    #[test]
    fn test_content_hash_parallel() {
        let data = vec![7u8; 3 * 1024 * 1024];
        let hash1 = ContentHash(blake3::hash(&data));
        let hash2 = ContentHash::compute(&data);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(b"hex");
        assert_eq!(ContentHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(ContentHash::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext = b"secret message";

        let sealed = seal(plaintext, &key, b"aad", NonceMode::Random).unwrap();
        assert_eq!(sealed.ciphertext.len(), plaintext.len());
        let opened = open(&sealed, &key, b"aad").unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_seal_empty_plaintext() {
        let key = EncryptionKey::generate();
        let sealed = seal(b"", &key, b"", NonceMode::Random).unwrap();
        assert!(sealed.ciphertext.is_empty());
        assert!(open(&sealed, &key, b"").unwrap().is_empty());
    }

    #[test]
    fn test_random_nonce_never_repeats_ciphertext() {
        let key = EncryptionKey::generate();
        let a = seal(b"same", &key, b"", NonceMode::Random).unwrap();
        let b = seal(b"same", &key, b"", NonceMode::Random).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.signing_bytes(), b.signing_bytes());
    }

    #[test]
    fn test_synthetic_nonce_is_deterministic() {
        let key = EncryptionKey::from_bytes([9u8; KEY_SIZE]);
        let a = seal(b"same", &key, b"ctx", NonceMode::Synthetic).unwrap();
        let b = seal(b"same", &key, b"ctx", NonceMode::Synthetic).unwrap();
        assert_eq!(a, b);

        let c = seal(b"other", &key, b"ctx", NonceMode::Synthetic).unwrap();
        assert_ne!(a.nonce, c.nonce);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = EncryptionKey::generate();
        let sealed = seal(b"payload", &key, b"key-a", NonceMode::Random).unwrap();
        assert!(open(&sealed, &key, b"key-b").is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();

        let sealed = seal(b"secret", &key1, b"", NonceMode::Random).unwrap();
        assert!(open(&sealed, &key2, b"").is_err());
    }

    #[test]
    fn test_tampered_parts_fail() {
        let key = EncryptionKey::generate();
        let sealed = seal(b"secret", &key, b"", NonceMode::Random).unwrap();

        let mut bad_ct = sealed.clone();
        bad_ct.ciphertext[0] ^= 0x01;
        assert!(open(&bad_ct, &key, b"").is_err());

        let mut bad_nonce = sealed.clone();
        bad_nonce.nonce[11] ^= 0x80;
        assert!(open(&bad_nonce, &key, b"").is_err());

        let mut bad_tag = sealed;
        bad_tag.auth_tag[0] ^= 0x01;
        assert!(open(&bad_tag, &key, b"").is_err());
    }

    #[test]
    fn test_password_derivation_is_deterministic() {
        let a = EncryptionKey::derive_from_password(b"correct horse", b"saltsaltsalt").unwrap();
        let b = EncryptionKey::derive_from_password(b"correct horse", b"saltsaltsalt").unwrap();
        let c = EncryptionKey::derive_from_password(b"battery staple", b"saltsaltsalt").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
