use slashrouter::crypto::KeyPair;
use slashrouter::dht::{GetOptions, KademliaConfig, KademliaNode, PutOptions, RecordNode};
use slashrouter::storage::MutableStore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// 在本地回环地址上启动一个记录节点
async fn start_node(keypair: Option<KeyPair>) -> RecordNode<KademliaNode> {
    let config = KademliaConfig {
        request_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let (engine, inbound) = KademliaNode::bind(config, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();

    let node = RecordNode::new(Arc::new(engine), Arc::new(MutableStore::cache_only(64)), keypair);
    node.serve(inbound);
    node
}

#[tokio::test]
async fn test_put_and_get_over_udp() {
    let _ = env_logger::builder().is_test(true).try_init();

    let seed = start_node(None).await;
    let peer = start_node(None).await;
    let keypair = KeyPair::from_seed(&KeyPair::seed_from_text("udp test")).unwrap();
    let publisher = start_node(Some(keypair.clone())).await;
    let reader = start_node(None).await;

    let seed_addr = seed.engine().local_addr();
    for node in [&peer, &publisher, &reader] {
        assert_eq!(node.engine().bootstrap(&[seed_addr]).await.unwrap(), 1);
    }

    let result = publisher
        .put(vec!["udp://a".to_string(), "udp://b".to_string()], PutOptions::default().with_seq(5))
        .await
        .unwrap();
    assert_eq!(result.seq, 5);
    assert!(result.acknowledged >= 1);

    let resolved = reader
        .get(keypair.public.as_bytes(), GetOptions::default())
        .await
        .unwrap()
        .expect("record should resolve over udp");
    assert_eq!(resolved.seq, 5);
    assert_eq!(resolved.value, vec!["udp://a".to_string(), "udp://b".to_string()]);

    // 更旧的版本不会被接受
    let stale = publisher.put_one("old", PutOptions::default().with_seq(4)).await.unwrap();
    assert_eq!(stale.acknowledged, 0);

    let resolved = reader
        .get(keypair.public.as_bytes(), GetOptions::default().with_seq(6))
        .await
        .unwrap();
    assert!(resolved.is_none());

    for node in [&seed, &peer, &publisher, &reader] {
        node.engine().close();
    }
}
