use std::collections::{HashMap, VecDeque};

/// Default number of records kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 65536;

/// Fixed-capacity map that evicts in insertion order.
///
/// Reads never change eviction order. Overwriting a key keeps its original
/// position.
#[derive(Debug)]
pub struct FifoCache {
    capacity: usize,
    /// 按插入顺序排列的键，队首最旧
    order: VecDeque<String>,
    entries: HashMap<String, Vec<u8>>,
}

impl FifoCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            entries: HashMap::with_capacity(capacity.min(1024)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or overwrites `key`, returning the key evicted to make room.
    pub fn insert(&mut self, key: String, value: Vec<u8>) -> Option<String> {
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.order.pop_front().map(|oldest| {
                self.entries.remove(&oldest);
                oldest
            })
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FifoCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
