use crate::dht::protocol::{DhtMessage, MessageRoute};
use crate::dht::KademliaError;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// 单个数据报的最大长度
const MAX_DATAGRAM: usize = 65536;

type PendingRequests = HashMap<u64, (SocketAddr, oneshot::Sender<DhtMessage>)>;

/// DHT网络传输层
#[derive(Clone)]
pub struct DhtNetwork {
    /// UDP socket用于消息传输
    socket: Arc<UdpSocket>,

    /// 本地绑定地址
    local_addr: SocketAddr,

    /// 待处理的请求：消息ID -> (目标地址, 响应通道)
    pending_requests: Arc<Mutex<PendingRequests>>,

    /// 消息ID计数器
    message_id_counter: Arc<AtomicU64>,

    /// 入站消息通道
    inbound_tx: mpsc::Sender<MessageRoute>,

    /// 接收任务
    receive_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DhtNetwork {
    /// 创建新的DHT网络实例
    pub async fn new(bind_addr: SocketAddr) -> Result<(Self, mpsc::Receiver<MessageRoute>), KademliaError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| KademliaError::OperationFailed(format!("Failed to bind UDP socket: {}", e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| KademliaError::OperationFailed(format!("Failed to get local address: {}", e)))?;

        info!("DHT network bound to {}", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::channel(1000);

        let network = Self {
            socket: Arc::new(socket),
            local_addr,
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            message_id_counter: Arc::new(AtomicU64::new(1)),
            inbound_tx,
            receive_task: Arc::new(Mutex::new(None)),
        };

        Ok((network, inbound_rx))
    }

    /// 启动网络监听
    pub fn start(&self) {
        let handle = self.spawn_receive_task();
        if let Some(old) = lock(&self.receive_task).replace(handle) {
            old.abort();
        }
        info!("DHT network started on {}", self.local_addr);
    }

    /// 停止网络，未完成的请求随之失败
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.receive_task).take() {
            handle.abort();
        }
        lock(&self.pending_requests).clear();
        info!("DHT network stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.receive_task).is_some()
    }

    /// 发送消息并等待响应
    pub async fn send_request(
        &self,
        target_addr: SocketAddr,
        message: DhtMessage,
        timeout_duration: Duration,
    ) -> Result<DhtMessage, KademliaError> {
        if !self.is_running() {
            return Err(KademliaError::OperationFailed("Network not started".to_string()));
        }

        let message_id = self.generate_message_id();
        let message = message.with_message_id(message_id);

        let (response_tx, response_rx) = oneshot::channel();
        lock(&self.pending_requests).insert(message_id, (target_addr, response_tx));

        let message_bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.remove_pending_request(message_id);
                return Err(KademliaError::OperationFailed(format!("Failed to serialize message: {}", e)));
            }
        };

        if let Err(e) = self.socket.send_to(&message_bytes, target_addr).await {
            self.remove_pending_request(message_id);
            return Err(KademliaError::OperationFailed(format!("Failed to send message: {}", e)));
        }

        debug!("Sent message {} to {}", message_id, target_addr);

        match timeout(timeout_duration, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(KademliaError::OperationFailed("Response channel closed".to_string())),
            Err(_) => {
                self.remove_pending_request(message_id);
                Err(KademliaError::Timeout(format!("Request {} to {}", message_id, target_addr)))
            }
        }
    }

    /// 发送响应消息（不等待回复）
    pub async fn send_response(&self, target_addr: SocketAddr, message: DhtMessage) -> Result<(), KademliaError> {
        let message_bytes = message
            .to_bytes()
            .map_err(|e| KademliaError::OperationFailed(format!("Failed to serialize message: {}", e)))?;

        self.socket
            .send_to(&message_bytes, target_addr)
            .await
            .map_err(|e| KademliaError::OperationFailed(format!("Failed to send response: {}", e)))?;

        debug!("Sent response {} to {}", message.message_id(), target_addr);
        Ok(())
    }

    /// 获取本地地址
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn generate_message_id(&self) -> u64 {
        self.message_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_pending_request(&self, message_id: u64) {
        lock(&self.pending_requests).remove(&message_id);
    }

    fn spawn_receive_task(&self) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let pending_requests = self.pending_requests.clone();
        let inbound_tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                let (len, addr) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Failed to receive message: {}", e);
                        continue;
                    }
                };

                let message = match DhtMessage::from_bytes(&buffer[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Failed to parse message from {}: {}", addr, e);
                        continue;
                    }
                };

                let message_id = message.message_id();
                debug!("Received message {} from {}", message_id, addr);

                if message.is_response() {
                    // 只接受来自请求目标地址的响应
                    let waiter = {
                        let mut pending = lock(&pending_requests);
                        match pending.get(&message_id) {
                            Some((expected, _)) if *expected == addr => pending.remove(&message_id),
                            _ => None,
                        }
                    };
                    match waiter {
                        Some((_, response_tx)) => {
                            let _ = response_tx.send(message);
                        }
                        None => debug!("Dropping unsolicited response {} from {}", message_id, addr),
                    }
                    continue;
                }

                if inbound_tx.send(MessageRoute::new(addr, message)).await.is_err() {
                    debug!("Inbound channel closed, stopping receive task");
                    break;
                }
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{NodeId, NodeInfo};
    use std::net::{IpAddr, Ipv4Addr};

    async fn create_test_network() -> (DhtNetwork, mpsc::Receiver<MessageRoute>) {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        DhtNetwork::new(bind_addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_network_creation() {
        let (network, _) = create_test_network().await;
        assert!(network.local_addr().port() > 0);
        assert!(!network.is_running());
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (network1, _inbound1) = create_test_network().await;
        let (network2, mut inbound2) = create_test_network().await;
        network1.start();
        network2.start();

        let node1 = NodeInfo::new(NodeId::random(), network1.local_addr());
        let node2 = NodeInfo::new(NodeId::random(), network2.local_addr());

        let responder = network2.clone();
        tokio::spawn(async move {
            if let Some(route) = inbound2.recv().await {
                if let DhtMessage::Ping { message_id, .. } = route.message {
                    let pong = DhtMessage::Pong { sender: node2, message_id };
                    let _ = responder.send_response(route.from, pong).await;
                }
            }
        });

        let ping = DhtMessage::Ping { sender: node1, message_id: 0 };
        let result = network1
            .send_request(network2.local_addr(), ping, Duration::from_secs(1))
            .await;

        match result {
            Ok(DhtMessage::Pong { message_id, .. }) => assert!(message_id > 0),
            other => panic!("Expected Pong message, got {:?}", other),
        }

        network1.stop();
        network2.stop();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (network1, _inbound1) = create_test_network().await;
        let (network2, _inbound2) = create_test_network().await;
        network1.start();

        let ping = DhtMessage::Ping {
            sender: NodeInfo::new(NodeId::random(), network1.local_addr()),
            message_id: 0,
        };
        let result = network1
            .send_request(network2.local_addr(), ping, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(KademliaError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let (network, _inbound) = create_test_network().await;
        let ping = DhtMessage::Ping {
            sender: NodeInfo::new(NodeId::random(), network.local_addr()),
            message_id: 0,
        };
        assert!(network
            .send_request(network.local_addr(), ping, Duration::from_millis(50))
            .await
            .is_err());
    }
}
