use ed25519_dalek::Verifier;
use ring::{digest, hmac};
use std::sync::OnceLock;

use crate::crypto::KeyPair;
use crate::record::{PutSignable, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// Domain string the signing namespace is derived from.
pub const NAMESPACE_DOMAIN: &str = "@slashtags/seeders-record";

/// Index of the record namespace under `NAMESPACE_DOMAIN`.
const NAMESPACE_INDEX: u8 = 0;

/// Length of the namespace prefix and of the payload digest.
pub const HASH_LENGTH: usize = 32;

/// Returns the 32-byte domain-separation prefix for record signatures.
///
/// Derived once per process as `HMAC-SHA256(key = NAMESPACE_DOMAIN, [NAMESPACE_INDEX])`.
pub fn namespace() -> &'static [u8; HASH_LENGTH] {
    static NAMESPACE: OnceLock<[u8; HASH_LENGTH]> = OnceLock::new();
    NAMESPACE.get_or_init(|| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, NAMESPACE_DOMAIN.as_bytes());
        let tag = hmac::sign(&key, &[NAMESPACE_INDEX]);
        let mut ns = [0u8; HASH_LENGTH];
        ns.copy_from_slice(tag.as_ref());
        ns
    })
}

/// 生成消息摘要（SHA-256）
pub fn hash_message(message: &[u8]) -> [u8; HASH_LENGTH] {
    let digest = digest::digest(&digest::SHA256, message);
    let mut out = [0u8; HASH_LENGTH];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Builds `namespace || hash(encode(PutSignable { seq, value }))`.
pub fn signable(seq: u64, value: &[String]) -> [u8; 2 * HASH_LENGTH] {
    let mut out = [0u8; 2 * HASH_LENGTH];
    out[..HASH_LENGTH].copy_from_slice(namespace());
    out[HASH_LENGTH..].copy_from_slice(&hash_message(&PutSignable::new(seq, value).to_bytes()));
    out
}

/// Signs `(seq, value)` with the owner's key pair.
pub fn sign_record(seq: u64, value: &[String], keypair: &KeyPair) -> [u8; SIGNATURE_LENGTH] {
    keypair.sign(&signable(seq, value))
}

/// Checks a record signature. Any malformed key or signature yields `false`.
pub fn verify_record(
    signature: &[u8; SIGNATURE_LENGTH],
    seq: u64,
    value: &[String],
    public_key: &[u8; PUBLIC_KEY_LENGTH],
) -> bool {
    let public_key = match ed25519_dalek::PublicKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let signature = match ed25519_dalek::Signature::try_from(&signature[..]) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    public_key.verify(&signable(seq, value), &signature).is_ok()
}
