use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::record::{peek_seq, Record};
use crate::storage::backing::{MemoryStore, PersistentStore, StorageError};
use crate::storage::cache::FifoCache;

type KeyLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Cache-aside record store: a bounded FIFO cache in front of an optional
/// persistent store.
///
/// Keys are hex-encoded targets; values are encoded records the store never
/// looks inside. Without a persistent store the node keeps records in memory
/// only.
///
/// Writes to one key are applied one at a time. Reads never wait for a
/// write, and writes to different keys never wait for each other.
pub struct MutableStore<S = MemoryStore> {
    /// 内存缓存，锁从不跨越 await 点
    cache: Mutex<FifoCache>,

    /// 持久化后端
    backing: Option<S>,

    /// 每个键一把写锁，无人持有时移除
    key_locks: KeyLocks,

    /// 写入计数，读未命中回填缓存前用来检测并发写入
    writes: AtomicU64,
}

/// Holds the write lock of one key and drops its map entry when it is the
/// last user.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl MutableStore {
    /// Creates a store with no persistent backing.
    pub fn cache_only(capacity: usize) -> Self {
        Self::new(capacity, None)
    }
}

impl<S: PersistentStore> MutableStore<S> {
    pub fn new(capacity: usize, backing: Option<S>) -> Self {
        Self {
            cache: Mutex::new(FifoCache::new(capacity)),
            backing,
            key_locks: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    fn cache(&self) -> MutexGuard<'_, FifoCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, key: &str) -> Option<Vec<u8>> {
        self.cache().get(key).map(<[u8]>::to_vec)
    }

    async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();

        KeyGuard {
            locks: &self.key_locks,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Looks up the encoded record stored under `key`.
    ///
    /// A failing persistent read is reported as absent.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.cached(key) {
            return Some(value);
        }

        let backing = self.backing.as_ref()?;
        self.load(key, backing).await
    }

    /// 从后端读取；期间没有任何写入时才回填缓存
    async fn load(&self, key: &str, backing: &S) -> Option<Vec<u8>> {
        let writes = self.writes.load(Ordering::SeqCst);

        let value = match backing.get(key.as_bytes()).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!("Persistent read for {} failed, treating as absent: {}", key, e);
                return None;
            }
        };

        let mut cache = self.cache();
        if let Some(current) = cache.get(key) {
            return Some(current.to_vec());
        }
        if self.writes.load(Ordering::SeqCst) == writes {
            debug!("Loaded record {} from persistent storage", key);
            cache.insert(key.to_string(), value.clone());
        }
        Some(value)
    }

    /// Stores `record` under `key`, persistent store first.
    pub async fn put(&self, key: &str, record: &Record) -> Result<(), StorageError> {
        let _guard = self.lock_key(key).await;
        self.write_locked(key, record.to_bytes()).await
    }

    /// Stores `record` only if `accept` approves the currently stored bytes.
    ///
    /// The lookup and the write happen under the key's lock, so concurrent
    /// writers to the same key are applied one at a time. Returns whether the
    /// record was written.
    pub async fn put_if<F>(&self, key: &str, record: &Record, accept: F) -> Result<bool, StorageError>
    where
        F: FnOnce(Option<&[u8]>) -> bool,
    {
        let _guard = self.lock_key(key).await;

        let existing = match (self.cached(key), &self.backing) {
            (Some(value), _) => Some(value),
            (None, Some(backing)) => self.load(key, backing).await,
            (None, None) => None,
        };

        if !accept(existing.as_deref()) {
            return Ok(false);
        }

        self.write_locked(key, record.to_bytes()).await?;
        Ok(true)
    }

    /// Stores `record` only if its seq is strictly greater than the stored one.
    ///
    /// An unreadable stored entry is overwritten.
    pub async fn put_if_newer(&self, key: &str, record: &Record) -> Result<bool, StorageError> {
        let seq = record.seq;
        self.put_if(key, record, |existing| match existing {
            Some(bytes) => peek_seq(bytes).map(|current| seq > current).unwrap_or(true),
            None => true,
        })
        .await
    }

    async fn write_locked(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        if let Some(backing) = &self.backing {
            self.writes.fetch_add(1, Ordering::SeqCst);
            backing.put(key.as_bytes(), &bytes).await?;
        }

        if let Some(evicted) = self.cache().insert(key.to_string(), bytes) {
            debug!("Evicted record {} from cache", evicted);
        }

        Ok(())
    }

    /// Number of records currently cached in memory.
    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_persistent(&self) -> bool {
        self.backing.is_some()
    }

    pub fn backing(&self) -> Option<&S> {
        self.backing.as_ref()
    }

    /// 关闭持久化后端
    pub async fn close(&self) -> Result<(), StorageError> {
        match &self.backing {
            Some(backing) => backing.close().await,
            None => Ok(()),
        }
    }
}
