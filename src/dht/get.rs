use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::crypto::verify_record;
use crate::dht::{Command, CommitRequest, EngineError, NodeId, QueryReply, QueryRequest, RoutingEngine};
use crate::record::{encode_uint, Record, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// Decides whether a resolved record should be written back to stale peers.
pub type RefreshFn = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Options for resolving a record.
#[derive(Clone)]
pub struct GetOptions {
    /// Ignore replies older than this seq
    pub seq: u64,
    /// Wait for every reply and keep the newest, instead of returning the first valid one
    pub latest: bool,
    /// Write the winner back to peers that were missing it or behind
    pub refresh: Option<RefreshFn>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            seq: 0,
            latest: true,
            refresh: None,
        }
    }
}

impl GetOptions {
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn first_valid(mut self) -> Self {
        self.latest = false;
        self
    }

    pub fn with_refresh(mut self, refresh: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.refresh = Some(Arc::new(refresh));
        self
    }
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("seq", &self.seq)
            .field("latest", &self.latest)
            .field("refresh", &self.refresh.is_some())
            .finish()
    }
}

/// A verified record and the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord<P> {
    pub seq: u64,
    pub value: Vec<String>,
    pub signature: [u8; SIGNATURE_LENGTH],
    pub from: P,
}

/// What the aggregator made of one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The peer replied null
    Missing,
    /// The payload did not decode
    Malformed,
    /// Older than the requested seq
    TooOld,
    /// Not newer than the current best, so not verified
    NotNewer,
    /// Newer than the current best but the signature failed
    Invalid,
    /// Became the new best record
    Best,
}

struct Responder<P> {
    peer: P,
    token: Option<Vec<u8>>,
    /// The seq the peer claimed, `None` when it had nothing usable
    seen: Option<u64>,
}

/// Folds the replies of one scatter into the newest valid record.
///
/// It does no I/O. Feed it replies in arrival order from a single consumer.
pub struct GetAggregator<P> {
    public_key: [u8; PUBLIC_KEY_LENGTH],
    min_seq: u64,
    best: Option<(Record, P)>,
    responders: Vec<Responder<P>>,
}

impl<P: Clone> GetAggregator<P> {
    pub fn new(public_key: [u8; PUBLIC_KEY_LENGTH], min_seq: u64) -> Self {
        Self {
            public_key,
            min_seq,
            best: None,
            responders: Vec::new(),
        }
    }

    pub fn offer(&mut self, reply: QueryReply<P>) -> Offer {
        let (offer, seen) = self.judge(reply.value.as_deref(), &reply.from);
        self.responders.push(Responder {
            peer: reply.from,
            token: reply.token,
            seen,
        });
        offer
    }

    fn judge(&mut self, value: Option<&[u8]>, from: &P) -> (Offer, Option<u64>) {
        let bytes = match value {
            Some(bytes) => bytes,
            None => return (Offer::Missing, None),
        };

        let record = match Record::from_bytes(bytes) {
            Ok(record) => record,
            Err(_) => return (Offer::Malformed, None),
        };

        if record.seq < self.min_seq {
            return (Offer::TooOld, Some(record.seq));
        }

        // 不比当前最优新的回复无需验签
        if let Some((best, _)) = &self.best {
            if record.seq <= best.seq {
                return (Offer::NotNewer, Some(record.seq));
            }
        }

        if !verify_record(&record.signature, record.seq, &record.value, &self.public_key) {
            return (Offer::Invalid, None);
        }

        let seq = record.seq;
        self.best = Some((record, from.clone()));
        (Offer::Best, Some(seq))
    }

    /// The newest valid record so far.
    pub fn best(&self) -> Option<&Record> {
        self.best.as_ref().map(|(record, _)| record)
    }

    /// Number of replies offered so far.
    pub fn responses(&self) -> usize {
        self.responders.len()
    }

    /// Peers that should receive the current best record, with their write tokens.
    ///
    /// These are the responders that had nothing usable or something older.
    pub fn repair_targets(&self) -> Vec<(P, Vec<u8>)> {
        let best_seq = match self.best() {
            Some(best) => best.seq,
            None => return Vec::new(),
        };

        self.responders
            .iter()
            .filter(|r| r.seen.map_or(true, |seq| seq < best_seq))
            .filter_map(|r| r.token.clone().map(|token| (r.peer.clone(), token)))
            .collect()
    }

    pub fn finish(self) -> Option<ResolvedRecord<P>> {
        self.best.map(|(record, from)| ResolvedRecord {
            seq: record.seq,
            value: record.value,
            signature: record.signature,
            from,
        })
    }
}

/// Resolves the record published under `public_key`.
///
/// An empty or all-invalid reply set is `Ok(None)`.
pub async fn resolve<E: RoutingEngine>(
    engine: &Arc<E>,
    public_key: &[u8; PUBLIC_KEY_LENGTH],
    options: &GetOptions,
) -> Result<Option<ResolvedRecord<E::Peer>>, EngineError> {
    let target = NodeId::from_public_key(public_key);
    let mut replies = engine
        .query(QueryRequest {
            target: target.clone(),
            command: Command::Get,
            value: encode_uint(options.seq),
        })
        .await?;

    let mut aggregator = GetAggregator::new(*public_key, options.seq);

    while let Some(reply) = replies.recv().await {
        let offer = aggregator.offer(reply);
        debug!("GET {} reply: {:?}", target, offer);

        if offer == Offer::Best && !options.latest {
            return Ok(aggregator.finish());
        }
    }

    debug!("GET {} finished after {} replies", target, aggregator.responses());

    if let (Some(refresh), Some(best)) = (&options.refresh, aggregator.best()) {
        if refresh(best) {
            write_back(engine, &target, public_key, &aggregator).await;
        }
    }

    Ok(aggregator.finish())
}

/// Sends the winning record, as signed, to peers that lacked it.
async fn write_back<E: RoutingEngine>(
    engine: &Arc<E>,
    target: &NodeId,
    public_key: &[u8; PUBLIC_KEY_LENGTH],
    aggregator: &GetAggregator<E::Peer>,
) {
    let best = match aggregator.best() {
        Some(best) => best.clone(),
        None => return,
    };
    let value = best.into_put_request(*public_key).to_bytes();

    let mut tasks = JoinSet::new();
    for (peer, token) in aggregator.repair_targets() {
        let engine = engine.clone();
        let commit = CommitRequest {
            token,
            target: target.clone(),
            command: Command::Put,
            value: value.clone(),
        };
        tasks.spawn(async move {
            let result = engine.request(commit, &peer).await;
            (peer, result)
        });
    }

    let mut repaired = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Some(reply)))) if reply.is_ack() => repaired += 1,
            Ok((peer, Ok(reply))) => debug!("Write-back to {:?} not applied: {:?}", peer, reply),
            Ok((peer, Err(e))) => debug!("Write-back to {:?} failed: {}", peer, e),
            Err(e) => warn!("Write-back task failed: {}", e),
        }
    }

    if repaired > 0 {
        debug!("Repaired {} replicas of {}", repaired, target);
    }
}
