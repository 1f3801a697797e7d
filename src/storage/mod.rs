mod backing;
mod cache;
mod mutable;

pub use backing::{MemoryStore, PersistentStore, SledStore, StorageError};
pub use cache::{FifoCache, DEFAULT_CACHE_CAPACITY};
pub use mutable::MutableStore;

/// Storage key for a 32-byte target: its lowercase hex form.
pub fn target_key(target: &[u8; 32]) -> String {
    hex::encode(target)
}
