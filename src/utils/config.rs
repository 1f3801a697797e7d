use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::dht::KademliaConfig;
use crate::storage::DEFAULT_CACHE_CAPACITY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid address {0}: {1}")]
    AddressError(String, std::net::AddrParseError),

    #[error("Path error: {0}")]
    PathError(String),
}

/// 应用程序配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 监听地址
    pub listen_addr: String,

    /// DHT引导节点，格式: <ip>:<port>
    pub bootstrap_nodes: Vec<String>,

    /// 记录存储目录
    pub storage_dir: PathBuf,

    /// 内存缓存的记录数
    pub cache_capacity: usize,

    /// 每个k-bucket的大小
    pub k_value: usize,

    /// 并行查询数
    pub alpha_value: usize,

    /// 单次请求超时（毫秒）
    pub request_timeout_ms: u64,

    /// 日志级别
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            bootstrap_nodes: vec![],
            storage_dir: PathBuf::from("slashrouter-data"),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            k_value: 20,
            alpha_value: 3,
            request_timeout_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("slashrouter")
            .join("config.json")
    }

    /// 从文件加载配置，文件不存在时使用默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// 确保存储目录存在
    pub fn ensure_storage_dir(&self) -> Result<(), ConfigError> {
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::PathError("storage_dir is empty".to_string()));
        }
        create_dir_all(&self.storage_dir)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.listen_addr)
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.bootstrap_nodes.iter().map(|s| parse_addr(s)).collect()
    }

    pub fn kademlia(&self) -> KademliaConfig {
        KademliaConfig {
            k_value: self.k_value,
            alpha_value: self.alpha_value,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..KademliaConfig::default()
        }
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    s.trim()
        .parse()
        .map_err(|e| ConfigError::AddressError(s.to_string(), e))
}
