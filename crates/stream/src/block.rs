//! Fixed-capacity transport blocks and the writer that packs them.

use floe_common::{ColumnDesc, Error, Result};
use serde::{Deserialize, Serialize};

/// A fixed-capacity unit of serialized rows moving over the dispatch
/// transport. The payload is a sequence of newline-delimited self-describing
/// records; the header carries the column descriptors needed to retype them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportBlock {
    pub node_id: String,
    pub sequence: u64,
    /// Terminal flag: the sending side emits exactly one block with this set,
    /// always last.
    pub last: bool,
    pub columns: Vec<ColumnDesc>,
    pub payload: Vec<u8>,
}

impl TransportBlock {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Network(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Network(e.to_string()))
    }
}

/// Packs serialized records into blocks of bounded size.
///
/// The capacity invariant lives here and nowhere else: `append` hands back a
/// full block exactly when the next record would overflow it, and the caller
/// must flush that block before packing continues. `finish` drains whatever
/// remains as the terminal block.
pub struct BlockWriter {
    node_id: String,
    columns: Vec<ColumnDesc>,
    capacity: usize,
    sequence: u64,
    buf: Vec<u8>,
}

impl BlockWriter {
    pub fn new(node_id: impl Into<String>, columns: Vec<ColumnDesc>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            columns,
            capacity: capacity.max(1),
            sequence: 0,
            buf: Vec::new(),
        }
    }

    /// Buffer one record, returning a full block to flush first if the
    /// record would not fit. A record larger than the capacity travels in a
    /// block of its own.
    pub fn append(&mut self, record: &[u8]) -> Option<TransportBlock> {
        let flushed = if !self.buf.is_empty() && self.buf.len() + record.len() > self.capacity {
            Some(self.take(false))
        } else {
            None
        };
        self.buf.extend_from_slice(record);
        flushed
    }

    /// Drain the remainder as the terminal block. Always produces a block,
    /// even when no rows were ever appended, so the receiver sees exactly one
    /// terminal marker per stream.
    pub fn finish(mut self) -> TransportBlock {
        self.take(true)
    }

    fn take(&mut self, last: bool) -> TransportBlock {
        let block = TransportBlock {
            node_id: self.node_id.clone(),
            sequence: self.sequence,
            last,
            columns: self.columns.clone(),
            payload: std::mem::take(&mut self.buf),
        };
        self.sequence += 1;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(capacity: usize) -> BlockWriter {
        BlockWriter::new("node-a", vec![], capacity)
    }

    #[test]
    fn flushes_when_record_would_overflow() {
        let mut w = writer(10);
        assert!(w.append(b"123456").is_none());
        let block = w.append(b"789012").expect("should flush");
        assert_eq!(block.payload, b"123456");
        assert_eq!(block.sequence, 0);
        assert!(!block.last);

        let terminal = w.finish();
        assert_eq!(terminal.payload, b"789012");
        assert_eq!(terminal.sequence, 1);
        assert!(terminal.last);
    }

    #[test]
    fn oversized_record_travels_alone() {
        let mut w = writer(4);
        assert!(w.append(b"this-is-way-too-big").is_none());
        let flushed = w.append(b"x").expect("oversized record flushes first");
        assert_eq!(flushed.payload, b"this-is-way-too-big");
    }

    #[test]
    fn empty_stream_still_has_a_terminal_block() {
        let block = writer(8).finish();
        assert!(block.last);
        assert!(block.payload.is_empty());
        assert_eq!(block.sequence, 0);
    }

    #[test]
    fn envelope_round_trips() {
        let block = TransportBlock {
            node_id: "node-b".to_string(),
            sequence: 7,
            last: true,
            columns: vec![],
            payload: b"{\"a\":1}\n".to_vec(),
        };
        let decoded = TransportBlock::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, block);
    }
}
