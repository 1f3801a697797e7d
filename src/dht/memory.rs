use crate::dht::engine::{
    CommitRequest, EngineError, InboundRequest, IncomingRequest, QueryReply, QueryRequest, Reply,
    RoutingEngine,
};
use crate::dht::NodeId;
use log::debug;
use ring::hmac;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// 默认的最近节点数
pub const DEFAULT_K: usize = 20;

/// 等待处理器回复的默认时长
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct Member {
    inbound: mpsc::Sender<InboundRequest>,
    token_key: hmac::Key,
    connected: bool,
}

/// An in-process swarm.
///
/// Every member is reachable by every other member; a query reaches the `k`
/// connected members closest to the target by XOR distance. Members can be
/// disconnected to simulate unreachable peers.
#[derive(Clone)]
pub struct MemoryNetwork {
    k: usize,
    request_timeout: Duration,
    members: Arc<RwLock<HashMap<NodeId, Member>>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_K)
    }
}

impl MemoryNetwork {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            request_timeout: DEFAULT_TIMEOUT,
            members: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Sets how long a member may take to answer before it counts as silent.
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Member>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Member>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a member with a random id.
    pub fn join(&self) -> (MemoryEngine, mpsc::Receiver<InboundRequest>) {
        self.join_with_id(NodeId::random())
    }

    /// Adds a member at a chosen position in the keyspace.
    pub fn join_with_id(&self, id: NodeId) -> (MemoryEngine, mpsc::Receiver<InboundRequest>) {
        let (inbound, inbound_rx) = mpsc::channel(256);

        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);

        self.write().insert(
            id.clone(),
            Member {
                inbound,
                token_key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
                connected: true,
            },
        );

        debug!("Member {:?} joined the memory network", id);

        let engine = MemoryEngine {
            id,
            network: self.clone(),
        };
        (engine, inbound_rx)
    }

    /// Makes a member unreachable until `reconnect` is called.
    pub fn disconnect(&self, id: &NodeId) {
        if let Some(member) = self.write().get_mut(id) {
            member.connected = false;
        }
    }

    pub fn reconnect(&self, id: &NodeId) {
        if let Some(member) = self.write().get_mut(id) {
            member.connected = true;
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// The `k` connected members closest to `target`, excluding `exclude`.
    pub fn closest(&self, target: &NodeId, exclude: &NodeId) -> Vec<NodeId> {
        let members = self.read();
        let mut ids: Vec<&NodeId> = members
            .iter()
            .filter(|(id, member)| member.connected && *id != exclude)
            .map(|(id, _)| id)
            .collect();
        ids.sort_by_key(|id| id.distance(target));
        ids.into_iter().take(self.k).cloned().collect()
    }

    /// 查找连接中的成员，返回其入站通道和令牌密钥
    fn reachable(&self, id: &NodeId) -> Option<(mpsc::Sender<InboundRequest>, hmac::Key)> {
        let members = self.read();
        let member = members.get(id).filter(|m| m.connected)?;
        Some((member.inbound.clone(), member.token_key.clone()))
    }
}

/// One member's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryEngine {
    id: NodeId,
    network: MemoryNetwork,
}

impl MemoryEngine {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

/// 把请求交给成员的处理器并等待回复；处理器不在或超时视为沉默
async fn deliver(
    inbound: &mpsc::Sender<InboundRequest>,
    request: IncomingRequest,
    request_timeout: Duration,
) -> Option<Reply> {
    let (inbound_request, reply_rx) = InboundRequest::new(request);
    inbound.send(inbound_request).await.ok()?;
    timeout(request_timeout, reply_rx).await.ok()?.ok().flatten()
}

impl RoutingEngine for MemoryEngine {
    type Peer = NodeId;

    async fn query(&self, request: QueryRequest) -> Result<mpsc::Receiver<QueryReply<NodeId>>, EngineError> {
        let peers = self.network.closest(&request.target, &self.id);
        let (tx, rx) = mpsc::channel(peers.len().max(1));

        let mut tasks = JoinSet::new();
        for peer in peers {
            let (inbound, token_key) = match self.network.reachable(&peer) {
                Some(found) => found,
                None => continue,
            };
            let token = hmac::sign(&token_key, self.id.as_bytes()).as_ref().to_vec();
            let incoming = IncomingRequest {
                command: request.command.id(),
                target: Some(request.target.clone()),
                token: None,
                value: Some(request.value.clone()),
            };
            let tx = tx.clone();
            let request_timeout = self.network.request_timeout;

            tasks.spawn(async move {
                let value = match deliver(&inbound, incoming, request_timeout).await {
                    Some(Reply::Value(bytes)) => Some(bytes),
                    Some(_) => None,
                    // 沉默的节点不产生回复
                    None => return,
                };
                let reply = QueryReply {
                    from: peer,
                    token: Some(token),
                    value,
                };
                let _ = tx.send(reply).await;
            });
        }

        // tx 的最后一个副本随任务结束而释放，通道随之关闭
        tokio::spawn(async move { while tasks.join_next().await.is_some() {} });

        Ok(rx)
    }

    async fn request(&self, request: CommitRequest, to: &NodeId) -> Result<Option<Reply>, EngineError> {
        let (inbound, token_key) = self
            .network
            .reachable(to)
            .ok_or_else(|| EngineError::Unreachable(to.to_string()))?;

        if hmac::verify(&token_key, self.id.as_bytes(), &request.token).is_err() {
            debug!("{:?} dropped {} from {:?} with bad token", to, request.command, self.id);
            return Ok(None);
        }

        let incoming = IncomingRequest {
            command: request.command.id(),
            target: Some(request.target),
            token: Some(request.token),
            value: Some(request.value),
        };
        Ok(deliver(&inbound, incoming, self.network.request_timeout).await)
    }
}
