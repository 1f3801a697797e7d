use crate::dht::kademlia::{NodeId, NodeInfo};
use std::collections::{HashMap, VecDeque};

const BUCKET_COUNT: usize = 256; // 桶的数量，对应NodeId的比特数

/// 路由表实现，基于Kademlia的k-bucket结构
pub struct RoutingTable {
    /// 本地节点ID
    local_id: NodeId,

    /// 每个bucket最多容纳的节点数
    bucket_size: usize,

    /// k-buckets，队首是最久未见的节点
    buckets: Vec<VecDeque<NodeInfo>>,

    /// 节点信息的哈希表，用于快速查找
    nodes: HashMap<NodeId, NodeInfo>,
}

impl RoutingTable {
    /// 创建新的路由表
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        Self {
            local_id,
            bucket_size: bucket_size.max(1),
            buckets: (0..BUCKET_COUNT).map(|_| VecDeque::new()).collect(),
            nodes: HashMap::new(),
        }
    }

    /// 计算应该放入哪个bucket：公共前缀的比特长度
    fn bucket_index(&self, id: &NodeId) -> usize {
        let distance = self.local_id.distance(id);

        for (i, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        // 如果所有字节都是0，这是本地节点自己
        BUCKET_COUNT - 1
    }

    /// 添加或刷新节点，返回节点是否在表中
    ///
    /// 已知节点移到队尾（最近看到的），地址随之更新。bucket已满时丢弃新节点。
    pub fn update_node(&mut self, node: NodeInfo) -> bool {
        if node.id == self.local_id {
            return false;
        }

        let bucket_idx = self.bucket_index(&node.id);
        let bucket = &mut self.buckets[bucket_idx];

        if let Some(pos) = bucket.iter().position(|n| n.id == node.id) {
            bucket.remove(pos);
        } else if bucket.len() >= self.bucket_size {
            return false;
        }

        bucket.push_back(node.clone());
        self.nodes.insert(node.id.clone(), node);
        true
    }

    /// 移除无响应的节点
    pub fn remove_node(&mut self, id: &NodeId) -> Option<NodeInfo> {
        let removed = self.nodes.remove(id)?;
        let bucket_idx = self.bucket_index(id);
        self.buckets[bucket_idx].retain(|n| n.id != *id);
        Some(removed)
    }

    /// 获取特定节点信息
    pub fn get_node(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    /// 获取离目标节点最近的count个节点
    pub fn get_closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<&NodeInfo> = self.nodes.values().collect();
        nodes.sort_by_key(|node| node.id.distance(target));
        nodes.into_iter().take(count).cloned().collect()
    }

    /// 获取路由表中的节点总数
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
