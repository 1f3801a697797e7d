/*
 * UDP Kademlia routing engine
 *
 * Peers are found with an iterative lookup over a 256-bucket routing table.
 * Every query reply carries a write token bound to the requester, and a
 * later Request datagram must present that token before it is dispatched to
 * the record handler.
 */

use crate::crypto::hash_message;
use crate::dht::engine::{
    CommitRequest, EngineError, InboundRequest, IncomingRequest, QueryReply, QueryRequest, Reply,
    RoutingEngine,
};
use crate::dht::network::DhtNetwork;
use crate::dht::protocol::{DhtMessage, MessageRoute};
use crate::dht::routing::RoutingTable;
use log::{debug, info, warn};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum KademliaError {
    #[error("Node ID derivation failed: {0}")]
    NodeIdDerivationFailed(String),

    #[error("DHT operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),
}

impl From<KademliaError> for EngineError {
    fn from(e: KademliaError) -> Self {
        match e {
            KademliaError::Timeout(msg) => EngineError::Timeout(msg),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// Configuration for the Kademlia DHT
#[derive(Debug, Clone)]
pub struct KademliaConfig {
    /// The number of nodes to keep in each k-bucket and to return per lookup
    pub k_value: usize,
    /// The number of nodes to query in parallel during lookups
    pub alpha_value: usize,
    /// How long to wait for a single datagram reply
    pub request_timeout: Duration,
    /// Upper bound on lookup iterations
    pub max_rounds: usize,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            k_value: 20,
            alpha_value: 3,
            request_timeout: Duration::from_secs(5),
            max_rounds: 10,
        }
    }
}

/// A 32-byte coordinate in the DHT keyspace, used for both nodes and targets
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// The routing target of a record owner: SHA-256 of the public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(hash_message(public_key))
    }

    /// Generates a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id);
        Self(id)
    }

    /// Calculates the XOR distance between two NodeIds
    pub fn distance(&self, other: &Self) -> [u8; 32] {
        let mut result = [0u8; 32];
        for (r, (a, b)) in result.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *r = a ^ b;
        }
        result
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, KademliaError> {
        let bytes = hex::decode(s).map_err(|e| KademliaError::NodeIdDerivationFailed(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = KademliaError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let id: [u8; 32] = bytes.try_into().map_err(|_| {
            KademliaError::NodeIdDerivationFailed(format!("Invalid length: expected 32, got {}", bytes.len()))
        })?;
        Ok(Self(id))
    }
}

/// A peer as the routing layer sees it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.id, self.addr)
    }
}

/// 节点内部共享状态
struct Shared {
    config: KademliaConfig,
    local_node: NodeInfo,
    routing_table: Mutex<RoutingTable>,
    network: DhtNetwork,
    /// 写入令牌密钥
    token_key: hmac::Key,
    /// 发往记录处理器的请求
    inbound_tx: mpsc::Sender<InboundRequest>,
}

/// Implementation of the Kademlia DHT node
pub struct KademliaNode {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl KademliaNode {
    /// Binds a UDP socket and starts answering routing traffic.
    ///
    /// Record commands addressed to this node come out of the returned
    /// receiver; hand it to `RecordNode::serve`.
    pub async fn bind(
        config: KademliaConfig,
        bind_addr: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<InboundRequest>), KademliaError> {
        let (network, message_rx) = DhtNetwork::new(bind_addr).await?;
        network.start();

        let local_node = NodeInfo::new(NodeId::random(), network.local_addr());
        let routing_table = RoutingTable::new(local_node.id.clone(), config.k_value);

        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);

        let (inbound_tx, inbound_rx) = mpsc::channel(1000);

        let shared = Arc::new(Shared {
            config,
            local_node,
            routing_table: Mutex::new(routing_table),
            network,
            token_key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
            inbound_tx,
        });

        let dispatcher = tokio::spawn(Shared::run(shared.clone(), message_rx));

        info!(
            "Kademlia node {} started on {}",
            shared.local_node.id,
            shared.local_node.addr
        );

        Ok((
            Self {
                shared,
                dispatcher: Mutex::new(Some(dispatcher)),
            },
            inbound_rx,
        ))
    }

    /// Joins the network through the given addresses.
    ///
    /// Returns how many of them answered. Unreachable addresses are skipped.
    pub async fn bootstrap(&self, addrs: &[SocketAddr]) -> Result<usize, KademliaError> {
        if addrs.is_empty() {
            info!("No bootstrap nodes provided, node will wait for incoming connections");
            return Ok(0);
        }

        info!("Bootstrapping with {} nodes", addrs.len());

        let mut successful = 0;
        for addr in addrs {
            match self.ping(*addr).await {
                Ok(node) => {
                    debug!("Successfully connected to bootstrap node {:?}", node);
                    successful += 1;
                }
                Err(e) => warn!("Failed to ping bootstrap node {}: {}", addr, e),
            }
        }

        if successful == 0 {
            warn!("Failed to connect to any bootstrap nodes");
            return Ok(0);
        }

        // 查找自己的ID以填充路由表
        self.find_node(&self.shared.local_node.id).await;
        info!(
            "Connected to {} bootstrap nodes, {} peers known after self-lookup",
            successful,
            self.routing_table_size()
        );

        Ok(successful)
    }

    /// Pings `addr` and records the responder in the routing table.
    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeInfo, KademliaError> {
        let ping = DhtMessage::Ping {
            sender: self.shared.local_node.clone(),
            message_id: 0,
        };

        match self
            .shared
            .network
            .send_request(addr, ping, self.shared.config.request_timeout)
            .await?
        {
            DhtMessage::Pong { sender, .. } => {
                let node = NodeInfo::new(sender.id, addr);
                self.shared.observe(node.clone());
                Ok(node)
            }
            other => Err(KademliaError::OperationFailed(format!(
                "Unexpected response to ping: {:?}",
                other
            ))),
        }
    }

    /// 查找离目标最近的节点
    pub async fn find_node(&self, target: &NodeId) -> Vec<NodeInfo> {
        self.shared.lookup(target.clone(), None, None, None).await
    }

    /// 获取本地节点信息
    pub fn local_node(&self) -> &NodeInfo {
        &self.shared.local_node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.network.local_addr()
    }

    /// 获取路由表大小
    pub fn routing_table_size(&self) -> usize {
        self.shared.routing_table().len()
    }

    /// Stops answering traffic and releases the socket task.
    pub fn close(&self) {
        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.shared.network.stop();
        info!("Kademlia node {} stopped", self.shared.local_node.id);
    }
}

impl RoutingEngine for KademliaNode {
    type Peer = NodeInfo;

    async fn query(&self, request: QueryRequest) -> Result<mpsc::Receiver<QueryReply<NodeInfo>>, EngineError> {
        if !self.shared.network.is_running() {
            return Err(EngineError::NotStarted);
        }

        let (tx, rx) = mpsc::channel(self.shared.config.k_value.max(1));
        let shared = self.shared.clone();
        let command = request.command.id();

        tokio::spawn(async move {
            let responded = shared
                .lookup(request.target.clone(), Some(command), Some(request.value), Some(tx))
                .await;
            debug!(
                "Query {} for {} finished with {} responders",
                command,
                request.target,
                responded.len()
            );
        });

        Ok(rx)
    }

    async fn request(&self, request: CommitRequest, to: &NodeInfo) -> Result<Option<Reply>, EngineError> {
        let message = DhtMessage::Request {
            sender: self.shared.local_node.clone(),
            target: request.target,
            command: request.command.id(),
            token: request.token,
            value: request.value,
            message_id: 0,
        };

        match self
            .shared
            .network
            .send_request(to.addr, message, self.shared.config.request_timeout)
            .await
        {
            Ok(DhtMessage::Response { reply, .. }) => Ok(Some(reply)),
            Ok(other) => Err(EngineError::Transport(format!(
                "Unexpected response from {:?}: {:?}",
                to, other
            ))),
            // 被丢弃的请求没有任何响应，和超时无法区分
            Err(KademliaError::Timeout(_)) => {
                debug!("No reply to {} from {:?}", request.command, to);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Shared {
    fn routing_table(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing_table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 记录联系过我们的节点
    fn observe(&self, node: NodeInfo) {
        let mut table = self.routing_table();
        let known = table.get_node(&node.id).is_some();
        if table.update_node(node.clone()) && !known {
            debug!("Added {:?} to routing table ({} nodes)", node, table.len());
        }
    }

    /// 写入令牌绑定请求者的ID和IP
    fn token_for(&self, requester: &NodeId, ip: IpAddr) -> Vec<u8> {
        hmac::sign(&self.token_key, &token_input(requester, ip)).as_ref().to_vec()
    }

    fn verify_token(&self, requester: &NodeId, ip: IpAddr, token: &[u8]) -> bool {
        hmac::verify(&self.token_key, &token_input(requester, ip), token).is_ok()
    }

    /// 消息处理循环，每条消息一个任务
    async fn run(shared: Arc<Self>, mut message_rx: mpsc::Receiver<MessageRoute>) {
        while let Some(route) = message_rx.recv().await {
            let shared = shared.clone();
            tokio::spawn(async move { shared.handle_message(route).await });
        }
        debug!("Message handler task stopped");
    }

    async fn handle_message(&self, route: MessageRoute) {
        let from = route.from;
        let sender = NodeInfo::new(route.message.sender().id.clone(), from);
        self.observe(sender.clone());

        let response = match route.message {
            DhtMessage::Ping { message_id, .. } => Some(DhtMessage::Pong {
                sender: self.local_node.clone(),
                message_id,
            }),

            DhtMessage::Query {
                target,
                command,
                value,
                message_id,
                ..
            } => {
                let nodes: Vec<NodeInfo> = self
                    .routing_table()
                    .get_closest(&target, self.config.k_value + 1)
                    .into_iter()
                    .filter(|n| n.id != sender.id)
                    .take(self.config.k_value)
                    .collect();

                let value = match command {
                    Some(command) => {
                        let request = IncomingRequest {
                            command,
                            target: Some(target),
                            token: None,
                            value,
                        };
                        match self.dispatch(request).await {
                            Some(Reply::Value(bytes)) => Some(bytes),
                            _ => None,
                        }
                    }
                    None => None,
                };

                Some(DhtMessage::QueryResponse {
                    sender: self.local_node.clone(),
                    nodes,
                    token: self.token_for(&sender.id, from.ip()),
                    value,
                    message_id,
                })
            }

            DhtMessage::Request {
                target,
                command,
                token,
                value,
                message_id,
                ..
            } => {
                if !self.verify_token(&sender.id, from.ip(), &token) {
                    debug!("Dropping request {} from {:?} with bad token", command, sender);
                    return;
                }

                let request = IncomingRequest {
                    command,
                    target: Some(target),
                    token: Some(token),
                    value: Some(value),
                };
                self.dispatch(request).await.map(|reply| DhtMessage::Response {
                    sender: self.local_node.clone(),
                    reply,
                    message_id,
                })
            }

            other => {
                debug!("Ignoring stray response {} from {}", other.message_id(), from);
                None
            }
        };

        if let Some(response) = response {
            if let Err(e) = self.network.send_response(from, response).await {
                warn!("Failed to send response to {}: {}", from, e);
            }
        }
    }

    /// 交给记录处理器并等待其回复
    async fn dispatch(&self, request: IncomingRequest) -> Option<Reply> {
        let (inbound, reply_rx) = InboundRequest::new(request);
        if self.inbound_tx.send(inbound).await.is_err() {
            debug!("No record handler attached, dropping request");
            return None;
        }

        match timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            _ => None,
        }
    }

    /// 迭代查找
    ///
    /// Once the lookup converges, the replies of the `k` closest responders
    /// are sent to `sink`, closest first. Returns those responders.
    async fn lookup(
        self: &Arc<Self>,
        target: NodeId,
        command: Option<u32>,
        value: Option<Vec<u8>>,
        sink: Option<mpsc::Sender<QueryReply<NodeInfo>>>,
    ) -> Vec<NodeInfo> {
        let k = self.config.k_value.max(1);
        let alpha = self.config.alpha_value.max(1);

        let mut candidates = self.routing_table().get_closest(&target, k);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut responded: Vec<NodeInfo> = Vec::new();
        let mut replies: HashMap<NodeId, QueryReply<NodeInfo>> = HashMap::new();

        if candidates.is_empty() {
            debug!("No nodes in routing table for lookup of {}", target);
            return responded;
        }

        for round in 0..self.config.max_rounds {
            let to_query: Vec<NodeInfo> = candidates
                .iter()
                .filter(|n| !queried.contains(&n.id))
                .take(alpha)
                .cloned()
                .collect();

            if to_query.is_empty() {
                break;
            }

            debug!("Lookup round {} for {}: querying {} nodes", round, target, to_query.len());

            let mut tasks = JoinSet::new();
            for node in to_query {
                queried.insert(node.id.clone());
                let shared = self.clone();
                let message = DhtMessage::Query {
                    sender: self.local_node.clone(),
                    target: target.clone(),
                    command,
                    value: value.clone(),
                    message_id: 0,
                };
                tasks.spawn(async move {
                    let result = shared
                        .network
                        .send_request(node.addr, message, shared.config.request_timeout)
                        .await;
                    (node, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (node, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!("Lookup task failed: {}", e);
                        continue;
                    }
                };

                let (sender, nodes, token, reply_value) = match result {
                    Ok(DhtMessage::QueryResponse {
                        sender, nodes, token, value, ..
                    }) => (sender, nodes, token, value),
                    Ok(other) => {
                        debug!("Unexpected lookup reply from {:?}: {:?}", node, other);
                        continue;
                    }
                    Err(e) => {
                        debug!("Failed to query {:?}: {}", node, e);
                        self.routing_table().remove_node(&node.id);
                        continue;
                    }
                };

                let peer = NodeInfo::new(sender.id, node.addr);
                self.observe(peer.clone());

                for found in nodes {
                    if found.id != self.local_node.id && !candidates.iter().any(|c| c.id == found.id) {
                        candidates.push(found);
                    }
                }

                if sink.is_some() {
                    let reply = QueryReply {
                        from: peer.clone(),
                        token: Some(token),
                        value: reply_value,
                    };
                    replies.insert(peer.id.clone(), reply);
                }
                responded.push(peer);
            }

            candidates.sort_by_key(|n| n.id.distance(&target));
            candidates.truncate(k);
        }

        responded.sort_by_key(|n| n.id.distance(&target));
        responded.truncate(k);

        // 只把最终最近的k个应答节点交给调用方，写入只发往它们
        if let Some(sink) = &sink {
            for peer in &responded {
                let reply = match replies.remove(&peer.id) {
                    Some(reply) => reply,
                    None => continue,
                };
                if sink.send(reply).await.is_err() {
                    debug!("Query consumer for {} went away", target);
                    break;
                }
            }
        }

        responded
    }
}

fn token_input(requester: &NodeId, ip: IpAddr) -> Vec<u8> {
    let mut input = requester.as_bytes().to_vec();
    match ip {
        IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
    }
    input
}
