//! In-memory connector.
//!
//! A [`MemoryEngine`] backs both roles a storage collaborator plays: the
//! per-node partition a remote query scans, and the coordinator-side store
//! holding the consolidation table. [`LoopbackTransport`] wires a set of
//! engines together as a cluster inside one process, running the real block
//! streamer over each reply so tests exercise the whole wire path.

pub mod engine;
mod eval;
pub mod loopback;

pub use engine::{MemCursor, MemoryEngine};
pub use loopback::LoopbackTransport;
