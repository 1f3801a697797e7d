use log::{debug, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinSet;

use crate::crypto::{sign_record, KeyPair};
use crate::dht::{Command, CommitRequest, EngineError, NodeId, QueryRequest, Reply, RoutingEngine};
use crate::record::{encode_uint, PutRequest, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// Options for publishing a record.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Signing key; the node's default key pair when `None`
    pub keypair: Option<KeyPair>,
    /// Explicit seq; `None` or `Some(0)` means the current time in milliseconds
    pub seq: Option<u64>,
}

impl PutOptions {
    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

/// Outcome of a publish.
///
/// `acknowledged` counts peers that confirmed the write. Zero is not an
/// error: the write was still dispatched to every peer in `peers`.
#[derive(Debug, Clone)]
pub struct PutResult<P> {
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    pub seq: u64,
    pub signature: [u8; SIGNATURE_LENGTH],
    pub peers: Vec<P>,
    pub acknowledged: usize,
}

/// 当前时间（毫秒），用作默认序列号
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Signs `value` and commits it to every peer the lookup toward its target reaches.
pub async fn publish<E: RoutingEngine>(
    engine: &Arc<E>,
    value: Vec<String>,
    keypair: &KeyPair,
    seq: Option<u64>,
) -> Result<PutResult<E::Peer>, EngineError> {
    let public_key = keypair.public.to_bytes();
    let target = NodeId::from_public_key(&public_key);
    let seq = seq.filter(|seq| *seq > 0).unwrap_or_else(now_millis);

    let signature = sign_record(seq, &value, keypair);
    let payload = PutRequest {
        public_key,
        seq,
        value,
        signature,
    }
    .to_bytes();

    // 查找同时带回写入令牌
    let mut replies = engine
        .query(QueryRequest {
            target: target.clone(),
            command: Command::Get,
            value: encode_uint(0),
        })
        .await?;

    let mut peers = Vec::new();
    let mut tasks = JoinSet::new();

    while let Some(reply) = replies.recv().await {
        let token = match reply.token {
            Some(token) => token,
            None => {
                debug!("Peer {:?} gave no write token for {}", reply.from, target);
                continue;
            }
        };

        peers.push(reply.from.clone());

        let engine = engine.clone();
        let peer = reply.from;
        let commit = CommitRequest {
            token,
            target: target.clone(),
            command: Command::Put,
            value: payload.clone(),
        };
        tasks.spawn(async move {
            let result = engine.request(commit, &peer).await;
            (peer, result)
        });
    }

    let mut acknowledged = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Some(reply)))) if reply.is_ack() => acknowledged += 1,
            Ok((peer, Ok(Some(Reply::Error(code))))) => {
                debug!("Peer {:?} rejected PUT {} at seq {}: {}", peer, target, seq, code)
            }
            Ok((peer, Ok(_))) => debug!("Peer {:?} did not answer PUT {}", peer, target),
            Ok((peer, Err(e))) => debug!("PUT {} to {:?} failed: {}", target, peer, e),
            Err(e) => warn!("PUT task failed: {}", e),
        }
    }

    debug!(
        "PUT {} seq {} dispatched to {} peers, {} acknowledged",
        target,
        seq,
        peers.len(),
        acknowledged
    );

    Ok(PutResult {
        public_key,
        seq,
        signature,
        peers,
        acknowledged,
    })
}
