//! In-process transport over a set of memory engines.

use crate::engine::MemoryEngine;
use async_trait::async_trait;
use floe_common::{Error, Result, StorageEngine};
use floe_stream::{BlockCipher, BlockStream, DispatchTransport, RowStreamer, DEFAULT_BLOCK_CAPACITY};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Routes dispatched queries to in-process node engines and replies through
/// the real block streamer, so the full encode/decode wire path runs even in
/// a single-process cluster.
pub struct LoopbackTransport {
    nodes: HashMap<String, Arc<MemoryEngine>>,
    batch_size: usize,
    block_capacity: usize,
    cipher: Option<Arc<dyn BlockCipher>>,
}

impl LoopbackTransport {
    pub fn new(batch_size: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            batch_size,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            cipher: None,
        }
    }

    pub fn block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity;
        self
    }

    pub fn add_node(mut self, node_id: impl Into<String>, engine: Arc<MemoryEngine>) -> Self {
        self.nodes.insert(node_id.into(), engine);
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn BlockCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }
}

#[async_trait]
impl DispatchTransport for LoopbackTransport {
    async fn dispatch(&self, node_id: &str, query: &str) -> Result<BlockStream> {
        let engine = self
            .nodes
            .get(node_id)
            .ok_or_else(|| Error::Network(format!("unknown node: {}", node_id)))?
            .clone();
        // Open before replying so a bad query fails the dispatch itself.
        let cursor = engine.open(query).await?;

        let (tx, rx) = mpsc::channel(4);
        let node = node_id.to_string();
        let batch_size = self.batch_size;
        let block_capacity = self.block_capacity;
        let cipher = self.cipher.clone();
        tokio::spawn(async move {
            let streamer = RowStreamer::new(batch_size).block_capacity(block_capacity);
            match streamer.stream_blocks(&node, cursor, cipher, tx).await {
                Ok((_, timing)) => tracing::debug!(
                    node = %node,
                    fetch_us = timing.fetch.as_micros() as u64,
                    transport_us = timing.transport.as_micros() as u64,
                    rows = timing.rows,
                    "loopback stream timing"
                ),
                Err(e) => tracing::warn!(node = %node, error = %e, "loopback stream failed"),
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}
