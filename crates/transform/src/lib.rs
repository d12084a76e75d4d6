//! Query transformer.
//!
//! Takes an immutable [`QuerySpec`](floe_common::QuerySpec) and produces a
//! [`RewritePlan`]: the remote query dispatched to every target node, the
//! consolidation-table DDL, and the local aggregation query that runs over the
//! consolidated partial results. Aggregates are decomposed algebraically so
//! the final answer is invariant to how the data is partitioned across nodes.

pub mod classify;
pub mod rewrite;

pub use classify::classify_projection;
pub use rewrite::{transform, RewritePlan, ANCHOR_TOKEN, TABLE_TOKEN};
