//! Node and member identities
//!
//! Every participant owns an Ed25519 signing key (block signatures) and an
//! X25519 exchange secret derived from it (group key wrapping).

use crate::error::{MeshVaultError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};

/// Ed25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

const EXCHANGE_KEY_CONTEXT: &str = "meshvault identity x25519 exchange key v1";

/// Signing and key-exchange keypair for one participant
pub struct Identity {
    signing: SigningKey,
    exchange: StaticSecret,
}

impl Identity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild an identity from a stored 32-byte Ed25519 secret
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let exchange_bytes = blake3::derive_key(EXCHANGE_KEY_CONTEXT, signing.as_bytes());
        Self {
            signing,
            exchange: StaticSecret::from(exchange_bytes),
        }
    }

    /// Ed25519 verifying key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// X25519 public key used by others to wrap keys for this identity
    pub fn exchange_public_key(&self) -> [u8; 32] {
        ExchangePublicKey::from(&self.exchange).to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 shared secret with another party's exchange public key
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = ExchangePublicKey::from(*their_public);
        self.exchange.diffie_hellman(&their_public).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &hex::encode(self.public_key())[..16])
    }
}

/// Verify an Ed25519 signature. `subject` names the signed object in errors.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
    subject: &str,
) -> Result<()> {
    let invalid = || MeshVaultError::SignatureInvalid(subject.to_string());

    let key_bytes: [u8; PUBLIC_KEY_SIZE] = public_key.try_into().map_err(|_| invalid())?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature.try_into().map_err(|_| invalid())?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| invalid())?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let signature = identity.sign(b"block bytes");
        verify_signature(&identity.public_key(), b"block bytes", &signature, "t").unwrap();
    }

    #[test]
    fn test_tampered_message_rejected() {
        let identity = Identity::generate();
        let signature = identity.sign(b"block bytes");
        let err = verify_signature(&identity.public_key(), b"block bytez", &signature, "t")
            .unwrap_err();
        assert!(matches!(err, MeshVaultError::SignatureInvalid(_)));
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        let identity = Identity::generate();
        let signature = identity.sign(b"m");
        assert!(verify_signature(&[0u8; 5], b"m", &signature, "t").is_err());
        assert!(verify_signature(&identity.public_key(), b"m", &signature[..10], "t").is_err());
    }

    #[test]
    fn test_identity_restores_from_secret() {
        let secret = [42u8; 32];
        let a = Identity::from_secret_bytes(&secret);
        let b = Identity::from_secret_bytes(&secret);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.exchange_public_key(), b.exchange_public_key());
        assert_ne!(a.public_key(), a.exchange_public_key());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        assert_eq!(
            alice.diffie_hellman(&bob.exchange_public_key()),
            bob.diffie_hellman(&alice.exchange_public_key())
        );
    }
}
