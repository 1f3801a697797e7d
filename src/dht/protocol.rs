use crate::dht::{NodeId, NodeInfo, Reply};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// UDP路由协议消息定义
///
/// Record payloads travel opaque inside `value`; only the routing envelope is
/// bincode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtMessage {
    /// Ping消息 - 用于检查节点是否在线
    Ping {
        sender: NodeInfo,
        message_id: u64,
    },

    /// Pong消息 - Ping的响应
    Pong {
        sender: NodeInfo,
        message_id: u64,
    },

    /// 查询请求 - 查找目标附近的节点，可附带一个命令
    Query {
        sender: NodeInfo,
        target: NodeId,
        /// `None` 表示仅查找节点
        command: Option<u32>,
        value: Option<Vec<u8>>,
        message_id: u64,
    },

    /// 查询响应 - 更近的节点、写入令牌以及命令结果
    QueryResponse {
        sender: NodeInfo,
        nodes: Vec<NodeInfo>,
        token: Vec<u8>,
        value: Option<Vec<u8>>,
        message_id: u64,
    },

    /// 带令牌的命令请求
    Request {
        sender: NodeInfo,
        target: NodeId,
        command: u32,
        token: Vec<u8>,
        value: Vec<u8>,
        message_id: u64,
    },

    /// 命令响应
    Response {
        sender: NodeInfo,
        reply: Reply,
        message_id: u64,
    },
}

impl DhtMessage {
    /// 获取消息的发送者信息
    pub fn sender(&self) -> &NodeInfo {
        match self {
            DhtMessage::Ping { sender, .. }
            | DhtMessage::Pong { sender, .. }
            | DhtMessage::Query { sender, .. }
            | DhtMessage::QueryResponse { sender, .. }
            | DhtMessage::Request { sender, .. }
            | DhtMessage::Response { sender, .. } => sender,
        }
    }

    /// 获取消息ID
    pub fn message_id(&self) -> u64 {
        match self {
            DhtMessage::Ping { message_id, .. }
            | DhtMessage::Pong { message_id, .. }
            | DhtMessage::Query { message_id, .. }
            | DhtMessage::QueryResponse { message_id, .. }
            | DhtMessage::Request { message_id, .. }
            | DhtMessage::Response { message_id, .. } => *message_id,
        }
    }

    /// 替换消息ID，由网络层在发送请求时分配
    pub fn with_message_id(mut self, id: u64) -> Self {
        match &mut self {
            DhtMessage::Ping { message_id, .. }
            | DhtMessage::Pong { message_id, .. }
            | DhtMessage::Query { message_id, .. }
            | DhtMessage::QueryResponse { message_id, .. }
            | DhtMessage::Request { message_id, .. }
            | DhtMessage::Response { message_id, .. } => *message_id = id,
        }
        self
    }

    /// 是否是对某个请求的响应
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::Pong { .. } | DhtMessage::QueryResponse { .. } | DhtMessage::Response { .. }
        )
    }

    /// 序列化消息为字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// 从字节反序列化消息
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// 消息路由信息
#[derive(Debug, Clone)]
pub struct MessageRoute {
    /// 发送者地址
    pub from: SocketAddr,
    /// 消息内容
    pub message: DhtMessage,
}

impl MessageRoute {
    pub fn new(from: SocketAddr, message: DhtMessage) -> Self {
        Self { from, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::ErrorCode;
    use std::net::{IpAddr, Ipv4Addr};

    fn create_test_node_info() -> NodeInfo {
        NodeInfo::new(
            NodeId::random(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8000),
        )
    }

    #[test]
    fn test_message_serialization() {
        let message = DhtMessage::Query {
            sender: create_test_node_info(),
            target: NodeId::random(),
            command: Some(101),
            value: Some(vec![0]),
            message_id: 12345,
        };

        let bytes = message.to_bytes().unwrap();
        let deserialized = DhtMessage::from_bytes(&bytes).unwrap();

        assert_eq!(deserialized.message_id(), 12345);
        match deserialized {
            DhtMessage::Query { command, value, .. } => {
                assert_eq!(command, Some(101));
                assert_eq!(value, Some(vec![0]));
            }
            other => panic!("Expected Query, got {:?}", other),
        }
    }

    #[test]
    fn test_response_carries_reply() {
        let message = DhtMessage::Response {
            sender: create_test_node_info(),
            reply: Reply::Error(ErrorCode::SeqTooLow),
            message_id: 1,
        };
        match DhtMessage::from_bytes(&message.to_bytes().unwrap()).unwrap() {
            DhtMessage::Response { reply, .. } => assert_eq!(reply, Reply::Error(ErrorCode::SeqTooLow)),
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_with_message_id() {
        let ping = DhtMessage::Ping { sender: create_test_node_info(), message_id: 0 };
        assert!(!ping.is_response());

        let ping = ping.with_message_id(42);
        assert_eq!(ping.message_id(), 42);
    }

    #[test]
    fn test_garbage_does_not_parse() {
        assert!(DhtMessage::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
