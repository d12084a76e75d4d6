//! Receive-side row sinks.

use async_trait::async_trait;
use floe_common::{Error, Result, ResultBatch};
use tokio::sync::mpsc;

/// Destination for decoded batches on the receiving side. The consolidation
/// inserter and the pass-through reply path both sit behind this trait.
#[async_trait]
pub trait RowSink: Send {
    async fn deliver(&mut self, batch: ResultBatch) -> Result<()>;
}

/// Sink that forwards batches over a channel, applying backpressure when the
/// consumer lags.
pub struct ForwardSink {
    tx: mpsc::Sender<ResultBatch>,
}

impl ForwardSink {
    pub fn new(tx: mpsc::Sender<ResultBatch>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RowSink for ForwardSink {
    async fn deliver(&mut self, batch: ResultBatch) -> Result<()> {
        self.tx
            .send(batch)
            .await
            .map_err(|_| Error::Network("batch consumer dropped".to_string()))
    }
}
