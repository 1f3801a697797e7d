use ed25519_dalek::{ExpandedSecretKey, PublicKey as EdPublicKey, SecretKey as EdSecretKey};
use std::fmt;
use thiserror::Error;

use crate::record::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Ed25519 public key identifying a record owner.
#[derive(Clone, Copy)]
pub struct PublicKey(EdPublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(KeyError::DeserializationFailed(format!(
                "Expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            )));
        }

        EdPublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))
    }

    /// Parses the 64-character hex form printed by the CLI.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| KeyError::DeserializationFailed(format!("Invalid hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for PublicKey {}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.0.as_bytes()[0..4]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Ed25519 secret key. Never printed.
pub struct SecretKey(EdSecretKey);

// EdSecretKey 不支持 Clone，只能从字节重新创建
impl Clone for SecretKey {
    fn clone(&self) -> Self {
        let secret = EdSecretKey::from_bytes(self.0.as_bytes())
            .expect("32-byte secret key is always valid");
        Self(secret)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey {{ <redacted> }}")
    }
}

/// Owner identity: the key pair a record is published and signed with.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
        Self::from_seed(&seed)
    }

    /// Deterministically derives a key pair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, KeyError> {
        let secret = EdSecretKey::from_bytes(seed)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        let public = EdPublicKey::from(&secret);

        Ok(Self {
            public: PublicKey(public),
            secret: SecretKey(secret),
        })
    }

    /// Builds a seed from arbitrary text by repeating its bytes across 32 bytes.
    ///
    /// An empty string yields the all-zero seed.
    pub fn seed_from_text(text: &str) -> [u8; 32] {
        let mut seed = [0u8; 32];
        let bytes = text.as_bytes();
        if !bytes.is_empty() {
            for (i, b) in seed.iter_mut().enumerate() {
                *b = bytes[i % bytes.len()];
            }
        }
        seed
    }

    /// Produces a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        let expanded = ExpandedSecretKey::from(&self.secret.0);
        expanded.sign(message, &self.public.0).to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let a = KeyPair::generate().expect("Failed to generate keypair");
        let b = KeyPair::generate().expect("Failed to generate keypair");
        assert_ne!(a.public, b.public);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let seed = KeyPair::seed_from_text("alice");
        let a = KeyPair::from_seed(&seed).unwrap();
        let b = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(a.public, b.public);
        assert_eq!(a.sign(b"msg"), b.sign(b"msg"));
    }

    #[test]
    fn test_seed_from_text_repeats() {
        let seed = KeyPair::seed_from_text("ab");
        assert_eq!(&seed[..4], b"abab");
        assert_eq!(KeyPair::seed_from_text(""), [0u8; 32]);
    }

    #[test]
    fn test_public_key_hex_round_trip() {
        let keypair = KeyPair::generate().unwrap();
        let hex_form = keypair.public.to_hex();
        assert_eq!(hex_form.len(), 64);
        assert_eq!(PublicKey::from_hex(&hex_form).unwrap(), keypair.public);
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_secret_key_clone_signs_identically() {
        let keypair = KeyPair::generate().unwrap();
        let cloned = keypair.clone();
        assert_eq!(keypair.sign(b"x"), cloned.sign(b"x"));
        assert_eq!(format!("{:?}", keypair.secret), "SecretKey { <redacted> }");
    }
}
