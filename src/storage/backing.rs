use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DbError(#[from] sled::Error),

    #[error("Storage error: {0}")]
    StorageError(String),
}

/// 持久化存储接口：按字节键读写，可能较慢，可能失败
pub trait PersistentStore: Send + Sync + 'static {
    /// 获取键对应的值
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, StorageError>> + Send;

    /// 存储键值对
    fn put(&self, key: &[u8], value: &[u8]) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// 关闭存储
    fn close(&self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// 内存存储实现，不跨进程保留数据
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.lock()
            .map_err(|e| StorageError::StorageError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.lock()
            .map_err(|e| StorageError::StorageError(e.to_string()))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Name of the sled tree holding mutable records.
const MUTABLES_TREE: &str = "mutables";

/// 持久化存储实现（使用sled数据库）
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    /// 打开（或创建）数据库
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let tree = db.open_tree(MUTABLES_TREE)?;

        debug!("Opened record storage at {}", path.display());

        Ok(Self { db, tree })
    }

    /// 已存储的记录数量
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// 恢复键在插入之前的值
    fn restore(&self, key: &[u8], previous: Option<sled::IVec>) -> Result<(), StorageError> {
        match previous {
            Some(value) => self.tree.insert(key, value)?,
            None => self.tree.remove(key)?,
        };
        Ok(())
    }

    /// 在阻塞线程池中刷新到磁盘
    async fn flush(&self) -> Result<(), StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush())
            .await
            .map_err(|e| StorageError::StorageError(e.to_string()))??;
        Ok(())
    }
}

impl PersistentStore for SledStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree.get(key)?.map(|value| value.to_vec()))
    }

    /// 刷盘失败时撤销插入，失败的写入不会在之后的读取中出现
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let previous = self.tree.insert(key, value)?;

        if let Err(e) = self.flush().await {
            warn!("Flush after writing {} failed, rolling back: {}", hex::encode(key), e);
            if let Err(undo) = self.restore(key, previous) {
                warn!("Rollback of {} failed: {}", hex::encode(key), undo);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.flush().await?;
        debug!("Closed record storage");
        Ok(())
    }
}
