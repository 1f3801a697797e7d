use slashrouter::crypto::{KeyPair, PublicKey};
use slashrouter::dht::{GetOptions, KademliaNode, PutOptions, RecordNode};
use slashrouter::storage::{MutableStore, SledStore};
use slashrouter::utils::{parse_log_level, setup_logger, Config};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use log::{error, info, warn, LevelFilter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::ctrl_c;

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[clap(long)]
    config: Option<PathBuf>,

    /// DHT 引导节点，格式: <ip>:<port>
    #[clap(short, long, action = ArgAction::Append)]
    bootstrap: Vec<String>,

    /// 日志级别
    #[clap(long)]
    log_level: Option<String>,

    /// 启用详细日志
    #[clap(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a long-lived node that stores records on disk
    Run {
        /// 监听端口
        #[clap(short, long)]
        port: Option<u16>,

        /// 存储目录
        #[clap(short, long)]
        storage: Option<PathBuf>,
    },

    /// Publish values under the key pair derived from a seed
    Put {
        /// Text whose bytes are repeated into a 32-byte seed
        seed: String,

        #[clap(required = true)]
        values: Vec<String>,

        /// Explicit seq instead of the current time
        #[clap(long)]
        seq: Option<u64>,
    },

    /// Resolve the values published under a public key
    Get {
        /// Hex-encoded public key
        public_key: String,

        /// Ignore records older than this seq
        #[clap(long, default_value = "0")]
        seq: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // 首次运行时保存默认配置
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            eprintln!("Could not save default config to {}: {}", config_path.display(), e);
        }
    }

    // 命令行参数覆盖配置
    if !args.bootstrap.is_empty() {
        config.bootstrap_nodes = args.bootstrap.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        parse_log_level(&config.log_level).unwrap_or(LevelFilter::Info)
    };
    setup_logger(Some(level)).map_err(anyhow::Error::msg)?;

    let result = match args.command {
        Commands::Run { port, storage } => run(&config, port, storage).await,
        Commands::Put { seed, values, seq } => put(&config, &seed, values, seq).await,
        Commands::Get { public_key, seq } => get(&config, &public_key, seq).await,
    };

    // 失败只记录日志，不体现在退出码上
    if let Err(e) = result {
        error!("{:#}", e);
    }

    Ok(())
}

/// 长期运行的节点
async fn run(config: &Config, port: Option<u16>, storage: Option<PathBuf>) -> Result<()> {
    let mut listen_addr = config.listen_addr()?;
    if let Some(port) = port {
        listen_addr.set_port(port);
    }

    // 命令行指定的目录覆盖配置
    let mut config = config.clone();
    if let Some(storage) = storage {
        config.storage_dir = storage;
    }
    config
        .ensure_storage_dir()
        .with_context(|| format!("Failed to create storage directory {}", config.storage_dir.display()))?;
    let storage_dir = config.storage_dir.clone();

    let backing = SledStore::open(&storage_dir)
        .with_context(|| format!("Failed to open storage at {}", storage_dir.display()))?;
    let store = Arc::new(MutableStore::new(config.cache_capacity, Some(backing)));

    let (engine, inbound) = KademliaNode::bind(config.kademlia(), listen_addr).await?;
    let engine = Arc::new(engine);
    engine.bootstrap(&config.bootstrap_addrs()?).await?;

    let node = RecordNode::new(engine.clone(), store, None);
    let server = node.serve(inbound);

    info!("{}", format!("Node {} listening on {}", engine.local_node().id, engine.local_addr()).green().bold());
    info!("Storage: {}", storage_dir.display());

    ctrl_c().await.context("Error waiting for Ctrl+C")?;
    info!("Shutting down...");

    engine.close();
    server.abort();
    node.close().await?;

    info!("Node stopped.");
    Ok(())
}

/// 为单次操作启动一个临时节点
async fn client(config: &Config) -> Result<RecordNode<KademliaNode>> {
    let bootstrap = config.bootstrap_addrs()?;
    if bootstrap.is_empty() {
        warn!("No bootstrap nodes configured, nothing will be reachable");
    }

    let bind_addr: SocketAddr = "0.0.0.0:0".parse()?;
    let (engine, inbound) = KademliaNode::bind(config.kademlia(), bind_addr).await?;
    let engine = Arc::new(engine);
    engine.bootstrap(&bootstrap).await?;

    let node = RecordNode::new(engine, Arc::new(MutableStore::cache_only(config.cache_capacity)), None);
    // 临时节点也应答记录命令，但不持久化
    let _ = node.serve(inbound);
    Ok(node)
}

async fn put(config: &Config, seed: &str, values: Vec<String>, seq: Option<u64>) -> Result<()> {
    let keypair = KeyPair::from_seed(&KeyPair::seed_from_text(seed))?;
    let node = client(config).await?;

    let options = PutOptions {
        keypair: Some(keypair),
        seq,
    };
    let result = node.put(values, options).await?;

    println!("{} {}", "Public key:".green().bold(), hex::encode(result.public_key));
    println!("{} {}", "Seq:".green().bold(), result.seq);
    println!(
        "{} {} peers, {} acknowledged",
        "Sent to".green().bold(),
        result.peers.len(),
        result.acknowledged
    );

    node.engine().close();
    Ok(())
}

async fn get(config: &Config, public_key: &str, seq: u64) -> Result<()> {
    let public_key = PublicKey::from_hex(public_key).context("Invalid public key")?;
    let node = client(config).await?;

    let resolved = node
        .get(public_key.as_bytes(), GetOptions::default().with_seq(seq))
        .await?;

    match resolved {
        Some(record) => {
            println!("{} {} (from {:?})", "Seq:".green().bold(), record.seq, record.from);
            for value in &record.value {
                println!("  {}", value.bright_cyan());
            }
        }
        None => println!("{}", "No record found".yellow()),
    }

    node.engine().close();
    Ok(())
}
