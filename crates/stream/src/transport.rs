//! Dispatch transport and encryption seams.
//!
//! The physical channel (and its handshake/TLS concerns) lives outside this
//! workspace; the engine only needs a way to send a query string to a node
//! and receive its stream of blocks, plus an injectable symmetric-encryption
//! hook applied per block.

use crate::block::TransportBlock;
use async_trait::async_trait;
use floe_common::Result;
use futures::stream::BoxStream;

pub type BlockStream = BoxStream<'static, Result<TransportBlock>>;

#[async_trait]
pub trait DispatchTransport: Send + Sync {
    /// Send a query to one node and return its reply stream. An error here
    /// means the node did not accept the query.
    async fn dispatch(&self, node_id: &str, query: &str) -> Result<BlockStream>;
}

/// Optional per-block symmetric encryption.
pub trait BlockCipher: Send + Sync {
    /// Called once before any block is sent; a failure aborts the stream
    /// before the first block leaves the node.
    fn setup(&self) -> Result<()>;

    fn seal(&self, payload: &[u8]) -> Result<Vec<u8>>;

    fn open(&self, payload: &[u8]) -> Result<Vec<u8>>;
}
