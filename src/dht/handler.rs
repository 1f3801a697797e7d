use log::{debug, warn};
use std::sync::Arc;

use crate::crypto::verify_record;
use crate::dht::{Command, ErrorCode, IncomingRequest, NodeId, Reply};
use crate::record::{decode_uint, peek_seq, PutRequest};
use crate::storage::{target_key, MemoryStore, MutableStore, PersistentStore};

/// Server-side logic for record commands.
///
/// `None` from any handler means the request is dropped without a reply.
/// Malformed or unauthenticated writes are dropped. Authenticated writes that
/// cannot be applied get an explicit `Reply::Error`.
pub struct RecordHandler<S = MemoryStore> {
    store: Arc<MutableStore<S>>,
}

impl<S> Clone for RecordHandler<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<S: PersistentStore> RecordHandler<S> {
    pub fn new(store: Arc<MutableStore<S>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MutableStore<S>> {
        &self.store
    }

    /// 根据命令分发请求
    pub async fn on_request(&self, req: &IncomingRequest) -> Option<Reply> {
        match Command::from_id(req.command) {
            Some(Command::Put) => self.on_put(req).await,
            Some(Command::Get) => self.on_get(req).await,
            None => {
                debug!("Ignoring unknown command {}", req.command);
                None
            }
        }
    }

    /// 处理写入请求
    pub async fn on_put(&self, req: &IncomingRequest) -> Option<Reply> {
        let (target, value) = match (&req.target, &req.token, &req.value) {
            (Some(target), Some(_), Some(value)) => (target, value),
            _ => {
                debug!("Dropping PUT with missing target, token or value");
                return None;
            }
        };

        let put = match PutRequest::from_bytes(value) {
            Ok(put) => put,
            Err(e) => {
                debug!("Dropping undecodable PUT for {}: {}", target, e);
                return None;
            }
        };

        // 目标必须等于公钥哈希，否则记录会被写到不属于其所有者的位置
        let hash = NodeId::from_public_key(&put.public_key);
        if hash != *target {
            debug!("Dropping PUT whose key hashes to {} but targets {}", hash, target);
            return None;
        }

        if !verify_record(&put.signature, put.seq, &put.value, &put.public_key) {
            debug!("Dropping PUT for {} with invalid signature", target);
            return None;
        }

        let key = target_key(hash.as_bytes());
        let seq = put.seq;
        let (_, record) = put.into_record();

        match self.store.put_if_newer(&key, &record).await {
            Ok(true) => {
                debug!("Stored record {} at seq {}", key, seq);
                Some(Reply::Null)
            }
            Ok(false) => {
                debug!("Rejecting stale PUT for {} at seq {}", key, seq);
                Some(Reply::Error(ErrorCode::SeqTooLow))
            }
            Err(e) => {
                warn!("Failed to persist record {}: {}", key, e);
                Some(Reply::Error(ErrorCode::StorageFailed))
            }
        }
    }

    /// 处理读取请求
    pub async fn on_get(&self, req: &IncomingRequest) -> Option<Reply> {
        let (target, value) = match (&req.target, &req.value) {
            (Some(target), Some(value)) => (target, value),
            _ => {
                debug!("Dropping GET with missing target or value");
                return None;
            }
        };

        let requested = match decode_uint(value) {
            Ok(seq) => seq,
            Err(e) => {
                debug!("Dropping GET for {} with bad seq: {}", target, e);
                return None;
            }
        };

        let key = target_key(target.as_bytes());
        let stored = match self.store.get(&key).await {
            Some(stored) => stored,
            None => return Some(Reply::Null),
        };

        match peek_seq(&stored) {
            Ok(local) if local >= requested => Some(Reply::Value(stored)),
            Ok(_) => Some(Reply::Null),
            Err(e) => {
                warn!("Stored record {} is unreadable: {}", key, e);
                Some(Reply::Null)
            }
        }
    }
}
