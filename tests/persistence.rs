use slashrouter::crypto::{sign_record, KeyPair};
use slashrouter::dht::{
    ErrorCode, GetOptions, IncomingRequest, MemoryNetwork, NodeId, RecordHandler, RecordNode, Reply, PUT,
};
use slashrouter::record::{PutRequest, Record};
use slashrouter::storage::{target_key, MutableStore, SledStore};
use std::path::Path;
use std::sync::Arc;

fn put_request(keypair: &KeyPair, seq: u64, value: &[&str]) -> IncomingRequest {
    let value: Vec<String> = value.iter().map(|s| s.to_string()).collect();
    let public_key = keypair.public.to_bytes();
    let signature = sign_record(seq, &value, keypair);

    IncomingRequest {
        command: PUT,
        target: Some(NodeId::from_public_key(&public_key)),
        token: Some(vec![1]),
        value: Some(
            PutRequest {
                public_key,
                seq,
                value,
                signature,
            }
            .to_bytes(),
        ),
    }
}

fn open_store(path: &Path) -> Arc<MutableStore<SledStore>> {
    Arc::new(MutableStore::new(16, Some(SledStore::open(path).unwrap())))
}

#[tokio::test]
async fn test_records_survive_restart() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let keypair = KeyPair::generate().unwrap();
    let public_key = keypair.public.to_bytes();
    let key = target_key(NodeId::from_public_key(&public_key).as_bytes());

    {
        let store = open_store(dir.path());
        let handler = RecordHandler::new(store.clone());

        assert_eq!(handler.on_request(&put_request(&keypair, 42, &["a", "b"])).await, Some(Reply::Null));
        assert_eq!(store.backing().unwrap().len(), 1);

        store.close().await.unwrap();
    }

    // 重新打开后缓存为空，记录从磁盘读回
    let store = open_store(dir.path());
    assert_eq!(store.cached_len(), 0);

    let bytes = store.get(&key).await.unwrap();
    let record = Record::from_bytes(&bytes).unwrap();
    assert_eq!(record.seq, 42);
    assert_eq!(record.value, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(store.cached_len(), 1);

    // 重启后旧版本仍被拒绝
    let handler = RecordHandler::new(store.clone());
    assert_eq!(
        handler.on_request(&put_request(&keypair, 41, &["old"])).await,
        Some(Reply::Error(ErrorCode::SeqTooLow))
    );

    // 通过网络也能读到
    let network = MemoryNetwork::default();
    let (engine, inbound) = network.join();
    let server = RecordNode::new(Arc::new(engine), store, None);
    server.serve(inbound);

    let (engine, _inbound) = network.join();
    let reader = RecordNode::new(Arc::new(engine), Arc::new(MutableStore::cache_only(16)), None);

    let resolved = reader.get(&public_key, GetOptions::default()).await.unwrap().unwrap();
    assert_eq!(resolved.seq, 42);
    assert_eq!(resolved.signature, record.signature);
}

#[tokio::test]
async fn test_cache_eviction_falls_back_to_disk() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MutableStore::new(2, Some(SledStore::open(dir.path()).unwrap())));
    let handler = RecordHandler::new(store.clone());

    let owners: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate().unwrap()).collect();
    for (i, owner) in owners.iter().enumerate() {
        let reply = handler.on_request(&put_request(owner, i as u64 + 1, &["v"])).await;
        assert_eq!(reply, Some(Reply::Null));
    }

    assert_eq!(store.cached_len(), 2);
    assert_eq!(store.backing().unwrap().len(), 4);

    for (i, owner) in owners.iter().enumerate() {
        let key = target_key(NodeId::from_public_key(owner.public.as_bytes()).as_bytes());
        let bytes = store.get(&key).await.unwrap();
        assert_eq!(Record::from_bytes(&bytes).unwrap().seq, i as u64 + 1);
    }

    store.close().await.unwrap();
}
