mod keys;
mod signing;

pub use keys::{KeyError, KeyPair, PublicKey, SecretKey};
pub use signing::{
    hash_message, namespace, sign_record, signable, verify_record, HASH_LENGTH, NAMESPACE_DOMAIN,
};

/*
 * Cryptography module for slashrouter
 *
 * This module handles all cryptographic operations for mutable records:
 * - Ed25519 key pairs identifying record owners
 * - The domain-separated signing namespace
 * - Record signing and verification over (seq, value)
 */
