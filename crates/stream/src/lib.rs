//! Row streamer and block transport.
//!
//! Bridges a storage cursor to either the dispatch transport (sending node)
//! or a local sink (receiving node), one bounded batch at a time. At any
//! instant at most one batch of `batch_size` rows is held in memory,
//! independent of total result-set size.

pub mod block;
pub mod codec;
pub mod limit;
pub mod sink;
pub mod streamer;
pub mod transforms;
pub mod transport;

pub use block::{BlockWriter, TransportBlock};
pub use codec::{decode_rows, encode_row};
pub use limit::GroupLimiter;
pub use sink::{ForwardSink, RowSink};
pub use streamer::{open_block, RowStreamer, StreamOutcome, DEFAULT_BLOCK_CAPACITY};
pub use transforms::RowTransforms;
pub use transport::{BlockCipher, BlockStream, DispatchTransport};
