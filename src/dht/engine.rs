/*
 * Contract between the record layer and the routing engine underneath it.
 *
 * The engine owns peer discovery, write tokens, transport, retries and
 * timeouts. The record layer only sees:
 *
 * 1. query   - scatter a command toward a target, yielding one reply per
 *              responding peer; the channel closing is the completion signal
 * 2. request - send a command (with a token) to one peer
 * 3. inbound - requests addressed to this node, each carrying a responder
 */

use crate::dht::{Command, ErrorCode, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Routing engine not started")]
    NotStarted,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A command scattered toward the peers closest to `target`.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub target: NodeId,
    pub command: Command,
    pub value: Vec<u8>,
}

/// One peer's answer to a query.
#[derive(Debug, Clone)]
pub struct QueryReply<P> {
    pub from: P,
    /// Credential authorising a later write to `from`
    pub token: Option<Vec<u8>>,
    /// Command payload; `None` when the peer replied null
    pub value: Option<Vec<u8>>,
}

/// A token-authorised command sent to a single peer.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub token: Vec<u8>,
    pub target: NodeId,
    pub command: Command,
    pub value: Vec<u8>,
}

/// What a handler sends back. Silence is modelled as `None` by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Value(Vec<u8>),
    Null,
    Error(ErrorCode),
}

impl Reply {
    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Null | Reply::Value(_))
    }
}

/// A request as seen by this node's handler. Any field may be missing.
#[derive(Clone, Default)]
pub struct IncomingRequest {
    pub command: u32,
    pub target: Option<NodeId>,
    pub token: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("command", &self.command)
            .field("target", &self.target)
            .field("token", &self.token.as_ref().map(|t| format!("[{} bytes]", t.len())))
            .field("value", &self.value.as_ref().map(|v| format!("[{} bytes]", v.len())))
            .finish()
    }
}

/// An inbound request plus the channel its reply goes back on.
///
/// Sending `None` (or dropping the responder) means "no reply".
#[derive(Debug)]
pub struct InboundRequest {
    pub request: IncomingRequest,
    pub responder: oneshot::Sender<Option<Reply>>,
}

impl InboundRequest {
    pub fn new(request: IncomingRequest) -> (Self, oneshot::Receiver<Option<Reply>>) {
        let (responder, rx) = oneshot::channel();
        (Self { request, responder }, rx)
    }
}

/// The peer-routing layer the record protocol runs on.
pub trait RoutingEngine: Send + Sync + 'static {
    /// How this engine addresses a peer.
    type Peer: Clone + fmt::Debug + Send + Sync + 'static;

    /// Scatters `request` toward its target.
    fn query(
        &self,
        request: QueryRequest,
    ) -> impl Future<Output = Result<mpsc::Receiver<QueryReply<Self::Peer>>, EngineError>> + Send;

    /// Sends a commit to one peer. `Ok(None)` means the peer stayed silent.
    fn request(
        &self,
        request: CommitRequest,
        to: &Self::Peer,
    ) -> impl Future<Output = Result<Option<Reply>, EngineError>> + Send;
}
