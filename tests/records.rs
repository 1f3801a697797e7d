use slashrouter::crypto::{sign_record, KeyPair};
use slashrouter::dht::{
    Command, CommitRequest, ErrorCode, GetOptions, MemoryEngine, MemoryNetwork, NodeId, PutOptions,
    QueryRequest, RecordNode, Reply, RoutingEngine,
};
use slashrouter::record::{encode_uint, PutRequest, Record};
use slashrouter::storage::{target_key, MutableStore};
use std::sync::Arc;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 加入网络并开始应答记录命令的节点
fn spawn_node(network: &MemoryNetwork, keypair: Option<KeyPair>) -> RecordNode<MemoryEngine> {
    let (engine, inbound) = network.join();
    let node = RecordNode::new(Arc::new(engine), Arc::new(MutableStore::cache_only(1024)), keypair);
    node.serve(inbound);
    node
}

fn spawn_swarm(network: &MemoryNetwork, size: usize) -> Vec<RecordNode<MemoryEngine>> {
    (0..size).map(|_| spawn_node(network, None)).collect()
}

fn signed_record(keypair: &KeyPair, seq: u64, value: &[&str]) -> Record {
    let value: Vec<String> = value.iter().map(|s| s.to_string()).collect();
    let signature = sign_record(seq, &value, keypair);
    Record::new(seq, value, signature)
}

/// 绕过处理器直接写入节点的本地存储
async fn preload(node: &RecordNode<MemoryEngine>, public_key: &[u8; 32], record: &Record) {
    let key = target_key(NodeId::from_public_key(public_key).as_bytes());
    node.store().put(&key, record).await.unwrap();
}

async fn stored_seq(node: &RecordNode<MemoryEngine>, public_key: &[u8; 32]) -> Option<u64> {
    let key = target_key(NodeId::from_public_key(public_key).as_bytes());
    let bytes = node.store().get(&key).await?;
    Some(Record::from_bytes(&bytes).unwrap().seq)
}

#[tokio::test]
async fn test_put_then_get_across_swarm() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 5);
    let keypair = KeyPair::generate().unwrap();
    let publisher = spawn_node(&network, Some(keypair.clone()));
    let reader = spawn_node(&network, None);

    let result = publisher
        .put(vec!["http://x".to_string()], PutOptions::default().with_seq(100))
        .await
        .unwrap();

    // 发布者不向自己写入；其余 6 个成员都确认
    assert_eq!(result.seq, 100);
    assert_eq!(result.peers.len(), 6);
    assert_eq!(result.acknowledged, 6);

    for node in &swarm {
        assert_eq!(stored_seq(node, keypair.public.as_bytes()).await, Some(100));
    }

    let resolved = reader
        .get(keypair.public.as_bytes(), GetOptions::default())
        .await
        .unwrap()
        .expect("record should resolve");
    assert_eq!(resolved.seq, 100);
    assert_eq!(resolved.value, vec!["http://x".to_string()]);
    assert_eq!(resolved.signature, result.signature);

    let newer = reader
        .get(keypair.public.as_bytes(), GetOptions::default().with_seq(101))
        .await
        .unwrap();
    assert!(newer.is_none());
}

#[tokio::test]
async fn test_unknown_key_resolves_to_none() {
    init_logging();

    let network = MemoryNetwork::default();
    let _swarm = spawn_swarm(&network, 3);
    let reader = spawn_node(&network, None);

    let stranger = KeyPair::generate().unwrap();
    let resolved = reader.get(stranger.public.as_bytes(), GetOptions::default()).await.unwrap();
    assert!(resolved.is_none());
}

#[tokio::test]
async fn test_newest_valid_record_wins() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 4);
    let reader = spawn_node(&network, None);
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();

    preload(&swarm[0], &public_key, &signed_record(&keypair, 5, &["five"])).await;
    preload(&swarm[1], &public_key, &signed_record(&keypair, 7, &["seven"])).await;
    preload(&swarm[2], &public_key, &signed_record(&keypair, 3, &["three"])).await;

    // 序列号最高但签名是伪造的
    let mut forged = signed_record(&keypair, 8, &["nine"]);
    forged.seq = 9;
    preload(&swarm[3], &public_key, &forged).await;

    let resolved = reader.get(&public_key, GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(resolved.seq, 7);
    assert_eq!(resolved.value, vec!["seven".to_string()]);
    assert_eq!(&resolved.from, swarm[1].engine().id());
}

#[tokio::test]
async fn test_stale_publish_is_rejected() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 3);
    let keypair = KeyPair::generate().unwrap();
    let publisher = spawn_node(&network, Some(keypair.clone()));

    let first = publisher.put_one("a", PutOptions::default().with_seq(10)).await.unwrap();
    assert_eq!(first.acknowledged, 3);

    let stale = publisher.put_one("b", PutOptions::default().with_seq(9)).await.unwrap();
    assert_eq!(stale.peers.len(), 3);
    assert_eq!(stale.acknowledged, 0);

    let same = publisher.put_one("c", PutOptions::default().with_seq(10)).await.unwrap();
    assert_eq!(same.acknowledged, 0);

    for node in &swarm {
        assert_eq!(stored_seq(node, keypair.public.as_bytes()).await, Some(10));
    }

    let newer = publisher.put_one("d", PutOptions::default().with_seq(11)).await.unwrap();
    assert_eq!(newer.acknowledged, 3);

    let resolved = publisher
        .get(keypair.public.as_bytes(), GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.seq, 11);
    assert_eq!(resolved.value, vec!["d".to_string()]);
}

#[tokio::test]
async fn test_stale_commit_gets_seq_too_low() {
    init_logging();

    let network = MemoryNetwork::default();
    let _swarm = spawn_swarm(&network, 2);
    let (client, _inbound) = network.join();
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();
    let target = NodeId::from_public_key(&public_key);

    let mut replies = client
        .query(QueryRequest {
            target: target.clone(),
            command: Command::Get,
            value: encode_uint(0),
        })
        .await
        .unwrap();
    let reply = replies.recv().await.unwrap();
    let token = reply.token.unwrap();

    let commit = |seq: u64| CommitRequest {
        token: token.clone(),
        target: target.clone(),
        command: Command::Put,
        value: signed_record(&keypair, seq, &["v"]).into_put_request(public_key).to_bytes(),
    };

    assert_eq!(client.request(commit(20), &reply.from).await.unwrap(), Some(Reply::Null));
    assert_eq!(
        client.request(commit(19), &reply.from).await.unwrap(),
        Some(Reply::Error(ErrorCode::SeqTooLow))
    );
}

#[tokio::test]
async fn test_mismatched_target_is_dropped() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 2);
    let (client, _inbound) = network.join();

    let owner = KeyPair::generate().unwrap();
    let other = KeyPair::generate().unwrap();
    let wrong_target = NodeId::from_public_key(other.public.as_bytes());

    let mut replies = client
        .query(QueryRequest {
            target: wrong_target.clone(),
            command: Command::Get,
            value: encode_uint(0),
        })
        .await
        .unwrap();

    // owner 签名的记录被投递到 other 的目标上
    let payload = PutRequest {
        public_key: owner.public.to_bytes(),
        seq: 1,
        value: vec!["v".to_string()],
        signature: sign_record(1, &["v".to_string()], &owner),
    }
    .to_bytes();

    while let Some(reply) = replies.recv().await {
        let commit = CommitRequest {
            token: reply.token.unwrap(),
            target: wrong_target.clone(),
            command: Command::Put,
            value: payload.clone(),
        };
        assert_eq!(client.request(commit, &reply.from).await.unwrap(), None);
    }

    for node in &swarm {
        assert_eq!(node.store().cached_len(), 0);
        assert_eq!(stored_seq(node, owner.public.as_bytes()).await, None);
        assert_eq!(stored_seq(node, other.public.as_bytes()).await, None);
    }
}

#[tokio::test]
async fn test_refresh_repairs_stale_peers() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 3);
    let reader = spawn_node(&network, None);
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();

    preload(&swarm[0], &public_key, &signed_record(&keypair, 7, &["seven"])).await;
    preload(&swarm[1], &public_key, &signed_record(&keypair, 3, &["three"])).await;

    // 不刷新时落后的节点保持原样
    let resolved = reader.get(&public_key, GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(resolved.seq, 7);
    assert_eq!(stored_seq(&swarm[1], &public_key).await, Some(3));
    assert_eq!(stored_seq(&swarm[2], &public_key).await, None);

    let resolved = reader
        .get(&public_key, GetOptions::default().with_refresh(|_| true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.seq, 7);

    for node in &swarm {
        assert_eq!(stored_seq(node, &public_key).await, Some(7));
    }
    // 查询不包含读者自己
    assert_eq!(stored_seq(&reader, &public_key).await, None);
}

#[tokio::test]
async fn test_refresh_predicate_can_decline() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 2);
    let reader = spawn_node(&network, None);
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();

    preload(&swarm[0], &public_key, &signed_record(&keypair, 4, &["four"])).await;

    let resolved = reader
        .get(&public_key, GetOptions::default().with_refresh(|record| record.seq > 100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.seq, 4);
    assert_eq!(stored_seq(&swarm[1], &public_key).await, None);
}

#[tokio::test]
async fn test_reconnected_peer_is_healed_by_refresh() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 3);
    let keypair = KeyPair::generate().unwrap();
    let publisher = spawn_node(&network, Some(keypair.clone()));
    let public_key = keypair.public.to_bytes();

    let offline = swarm[2].engine().id().clone();
    network.disconnect(&offline);

    let result = publisher.put_one("v1", PutOptions::default().with_seq(1)).await.unwrap();
    assert_eq!(result.acknowledged, 2);
    assert_eq!(stored_seq(&swarm[2], &public_key).await, None);

    network.reconnect(&offline);

    let resolved = publisher
        .get(&public_key, GetOptions::default().with_refresh(|_| true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.seq, 1);
    assert_eq!(stored_seq(&swarm[2], &public_key).await, Some(1));
}

#[tokio::test]
async fn test_first_valid_returns_early() {
    init_logging();

    let network = MemoryNetwork::default();
    let swarm = spawn_swarm(&network, 3);
    let reader = spawn_node(&network, None);
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();

    preload(&swarm[0], &public_key, &signed_record(&keypair, 2, &["two"])).await;
    preload(&swarm[1], &public_key, &signed_record(&keypair, 6, &["six"])).await;

    let resolved = reader
        .get(&public_key, GetOptions::default().first_valid())
        .await
        .unwrap()
        .unwrap();
    assert!(resolved.seq == 2 || resolved.seq == 6);

    // 快速路径不做回写
    let resolved = reader
        .get(&public_key, GetOptions::default().first_valid().with_refresh(|_| true))
        .await
        .unwrap()
        .unwrap();
    assert!(resolved.seq == 2 || resolved.seq == 6);
    assert_eq!(stored_seq(&swarm[2], &public_key).await, None);

    // 最低序列号过滤掉旧记录
    let resolved = reader
        .get(&public_key, GetOptions::default().first_valid().with_seq(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.seq, 6);
}

#[tokio::test]
async fn test_silent_peers_do_not_block_get() {
    init_logging();

    let network = MemoryNetwork::default().with_timeout(Duration::from_millis(100));
    let swarm = spawn_swarm(&network, 2);
    let reader = spawn_node(&network, None);
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();

    // 加入但从不应答的成员
    let (_stuck, _stuck_inbound) = network.join();

    preload(&swarm[0], &public_key, &signed_record(&keypair, 12, &["twelve"])).await;

    let resolved = reader.get(&public_key, GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(resolved.seq, 12);
    assert_eq!(&resolved.from, swarm[0].engine().id());
    assert_eq!(stored_seq(&swarm[1], &public_key).await, None);
}
