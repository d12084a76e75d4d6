//! The row streamer: cursor in, blocks or batches out.
//!
//! One streamer instance serves one stream. The memory bound is structural:
//! a batch is fetched, encoded and flushed before the next fetch is issued,
//! so at most `batch_size` rows plus one partially packed block are resident
//! at any instant regardless of result-set size.

use crate::block::{BlockWriter, TransportBlock};
use crate::codec::{decode_rows, encode_row};
use crate::sink::RowSink;
use crate::transforms::RowTransforms;
use crate::transport::BlockCipher;
use floe_common::{Cursor, Error, Result, ResultBatch, TimingSample};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const DEFAULT_BLOCK_CAPACITY: usize = 16 * 1024;

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The cursor was drained.
    Complete,
    /// The row-volume cap was hit; the stream was truncated at the cap.
    VolumeExceeded,
}

pub struct RowStreamer {
    batch_size: usize,
    block_capacity: usize,
    fetch_timeout: Option<Duration>,
    /// Row-volume cap across the whole stream, not per batch.
    max_rows: Option<u64>,
}

impl RowStreamer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            fetch_timeout: None,
            max_rows: None,
        }
    }

    pub fn block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity.max(1);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn max_rows(mut self, cap: u64) -> Self {
        self.max_rows = Some(cap);
        self
    }

    /// Sending side: drain a cursor into transport blocks.
    ///
    /// The cursor is closed on every path. Exactly one terminal block is sent
    /// unless the transport itself fails, in which case the error is both
    /// forwarded downstream and returned.
    pub async fn stream_blocks(
        &self,
        node_id: &str,
        mut cursor: Box<dyn Cursor>,
        cipher: Option<Arc<dyn BlockCipher>>,
        tx: mpsc::Sender<Result<TransportBlock>>,
    ) -> Result<(StreamOutcome, TimingSample)> {
        let result = self.run_sender(node_id, cursor.as_mut(), cipher, &tx).await;
        let closed = cursor.close().await;
        match result {
            Ok(done) => {
                closed?;
                Ok(done)
            }
            Err(err) => {
                // Forward so the receiving side fails the node instead of
                // waiting out its deadline. Best effort.
                let _ = tx.send(Err(clone_error(&err))).await;
                Err(err)
            }
        }
    }

    async fn run_sender(
        &self,
        node_id: &str,
        cursor: &mut dyn Cursor,
        cipher: Option<Arc<dyn BlockCipher>>,
        tx: &mpsc::Sender<Result<TransportBlock>>,
    ) -> Result<(StreamOutcome, TimingSample)> {
        if let Some(cipher) = &cipher {
            // Key setup must fail before any block leaves the node.
            cipher.setup()?;
        }

        let mut timing = TimingSample { node_id: node_id.to_string(), ..Default::default() };
        let mut writer: Option<BlockWriter> = None;
        let mut outcome = StreamOutcome::Complete;

        loop {
            let batch = match self.fetch_next(cursor, &mut timing).await? {
                Some(batch) => batch,
                None => break,
            };
            if writer.is_none() {
                writer = Some(BlockWriter::new(node_id, batch.columns.clone(), self.block_capacity));
            }
            let w = match writer.as_mut() {
                Some(w) => w,
                None => break,
            };
            for row in &batch.rows {
                if let Some(cap) = self.max_rows {
                    if timing.rows >= cap {
                        outcome = StreamOutcome::VolumeExceeded;
                        break;
                    }
                }
                let record = encode_row(&batch.columns, row)?;
                if let Some(full) = w.append(&record) {
                    self.send_block(full, cipher.as_deref(), tx, &mut timing).await?;
                }
                timing.rows += 1;
            }
            if outcome == StreamOutcome::VolumeExceeded {
                break;
            }
        }

        let terminal = writer
            .unwrap_or_else(|| BlockWriter::new(node_id, Vec::new(), self.block_capacity))
            .finish();
        self.send_block(terminal, cipher.as_deref(), tx, &mut timing).await?;
        tracing::debug!(node = %node_id, rows = timing.rows, ?outcome, "stream drained");
        Ok((outcome, timing))
    }

    /// Receiving side: drain a cursor through transforms into a sink. Used
    /// for the consolidation read-back and the pass-through reply path.
    pub async fn pump(
        &self,
        mut cursor: Box<dyn Cursor>,
        transforms: &mut RowTransforms,
        sink: &mut dyn RowSink,
    ) -> Result<(StreamOutcome, TimingSample)> {
        let result = self.run_pump(cursor.as_mut(), transforms, sink).await;
        let closed = cursor.close().await;
        let done = result?;
        closed?;
        Ok(done)
    }

    async fn run_pump(
        &self,
        cursor: &mut dyn Cursor,
        transforms: &mut RowTransforms,
        sink: &mut dyn RowSink,
    ) -> Result<(StreamOutcome, TimingSample)> {
        let mut timing = TimingSample::default();
        let mut outcome = StreamOutcome::Complete;
        while let Some(mut batch) = self.fetch_next(cursor, &mut timing).await? {
            transforms.apply(&mut batch);
            if let Some(cap) = self.max_rows {
                let remaining = cap.saturating_sub(timing.rows) as usize;
                if batch.rows.len() > remaining {
                    batch.rows.truncate(remaining);
                    outcome = StreamOutcome::VolumeExceeded;
                }
            }
            timing.rows += batch.rows.len() as u64;
            if !batch.rows.is_empty() {
                let started = Instant::now();
                sink.deliver(batch).await?;
                timing.transport += started.elapsed();
            }
            if outcome == StreamOutcome::VolumeExceeded {
                break;
            }
        }
        Ok((outcome, timing))
    }

    async fn fetch_next(
        &self,
        cursor: &mut dyn Cursor,
        timing: &mut TimingSample,
    ) -> Result<Option<ResultBatch>> {
        let started = Instant::now();
        let fetched = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, cursor.fetch_next(self.batch_size))
                .await
                .map_err(|_| Error::QueryTimeLimitExceeded)?,
            None => cursor.fetch_next(self.batch_size).await,
        };
        timing.fetch += started.elapsed();
        fetched
    }

    async fn send_block(
        &self,
        mut block: TransportBlock,
        cipher: Option<&dyn BlockCipher>,
        tx: &mpsc::Sender<Result<TransportBlock>>,
        timing: &mut TimingSample,
    ) -> Result<()> {
        if let Some(cipher) = cipher {
            block.payload = cipher.seal(&block.payload)?;
        }
        let started = Instant::now();
        tx.send(Ok(block))
            .await
            .map_err(|_| Error::Network("block consumer dropped".to_string()))?;
        timing.transport += started.elapsed();
        Ok(())
    }
}

/// Decode one received block into a typed batch, deciphering first when an
/// encryption collaborator is in play.
pub fn open_block(block: TransportBlock, cipher: Option<&dyn BlockCipher>) -> Result<ResultBatch> {
    let payload = match cipher {
        Some(cipher) => cipher.open(&block.payload)?,
        None => block.payload,
    };
    let rows = decode_rows(&block.columns, &payload)?;
    Ok(ResultBatch {
        node_id: block.node_id,
        sequence: block.sequence,
        last: block.last,
        columns: block.columns,
        rows,
    })
}

// Error is not Clone (source variants hold foreign error types); streams only
// ever forward the stringly variants.
fn clone_error(err: &Error) -> Error {
    match err {
        Error::QueryTimeLimitExceeded => Error::QueryTimeLimitExceeded,
        Error::VolumeExceeded => Error::VolumeExceeded,
        Error::Cancelled => Error::Cancelled,
        Error::Encryption(msg) => Error::Encryption(msg.clone()),
        Error::Fetch(msg) => Error::Fetch(msg.clone()),
        other => Error::Network(other.to_string()),
    }
}
