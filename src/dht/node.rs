use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::KeyPair;
use crate::dht::get::{resolve, GetOptions, ResolvedRecord};
use crate::dht::put::{publish, PutOptions, PutResult};
use crate::dht::{EngineError, InboundRequest, RecordHandler, RoutingEngine};
use crate::record::PUBLIC_KEY_LENGTH;
use crate::storage::{MemoryStore, MutableStore, PersistentStore, StorageError};

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("No key pair to sign with")]
    MissingKeyPair,

    #[error("Routing error: {0}")]
    Engine(#[from] EngineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A mutable-record node: the record handler for inbound commands plus the
/// publish and resolve operations, on top of a routing engine.
pub struct RecordNode<E, S = MemoryStore> {
    engine: Arc<E>,
    handler: RecordHandler<S>,
    /// 默认签名密钥
    keypair: Option<KeyPair>,
}

impl<E: RoutingEngine, S: PersistentStore> RecordNode<E, S> {
    pub fn new(engine: Arc<E>, store: Arc<MutableStore<S>>, keypair: Option<KeyPair>) -> Self {
        Self {
            engine,
            handler: RecordHandler::new(store),
            keypair,
        }
    }

    /// Publishes `value` under the key pair from `options`, or the node's default.
    pub async fn put(&self, value: Vec<String>, options: PutOptions) -> Result<PutResult<E::Peer>, RecordError> {
        let keypair = options
            .keypair
            .as_ref()
            .or(self.keypair.as_ref())
            .ok_or(RecordError::MissingKeyPair)?;

        let result = publish(&self.engine, value, keypair, options.seq).await?;
        info!(
            "Published {} at seq {} to {} peers ({} acknowledged)",
            hex::encode(result.public_key),
            result.seq,
            result.peers.len(),
            result.acknowledged
        );
        Ok(result)
    }

    /// Publishes a single string.
    pub async fn put_one(
        &self,
        value: impl Into<String>,
        options: PutOptions,
    ) -> Result<PutResult<E::Peer>, RecordError> {
        self.put(vec![value.into()], options).await
    }

    /// Resolves the record published under `public_key`.
    pub async fn get(
        &self,
        public_key: &[u8; PUBLIC_KEY_LENGTH],
        options: GetOptions,
    ) -> Result<Option<ResolvedRecord<E::Peer>>, RecordError> {
        let resolved = resolve(&self.engine, public_key, &options).await?;
        match &resolved {
            Some(record) => debug!("Resolved {} at seq {}", hex::encode(public_key), record.seq),
            None => debug!("Nothing found for {}", hex::encode(public_key)),
        }
        Ok(resolved)
    }

    /// Answers inbound record commands until the channel closes.
    ///
    /// Each request is handled on its own task.
    pub fn serve(&self, mut inbound: mpsc::Receiver<InboundRequest>) -> JoinHandle<()> {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            while let Some(InboundRequest { request, responder }) = inbound.recv().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let reply = handler.on_request(&request).await;
                    let _ = responder.send(reply);
                });
            }
            debug!("Inbound request channel closed");
        })
    }

    /// 关闭存储
    pub async fn close(&self) -> Result<(), RecordError> {
        self.handler.store().close().await?;
        Ok(())
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn handler(&self) -> &RecordHandler<S> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<MutableStore<S>> {
        self.handler.store()
    }

    pub fn keypair(&self) -> Option<&KeyPair> {
        self.keypair.as_ref()
    }
}
