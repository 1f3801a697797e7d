//! Signed, versioned mutable records on a Kademlia DHT.
//!
//! A record owner publishes a list of strings under its Ed25519 public key;
//! peers closest to the key's hash store the record and only accept newer
//! versions signed by the same key.

pub mod crypto;
pub mod dht;
pub mod record;
pub mod storage;
pub mod utils;
