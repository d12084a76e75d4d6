//! The consolidated reply handed back to the caller.

use floe_common::{ColumnDesc, Row};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ReplyStats {
    /// Nodes the query was dispatched to.
    pub targeted: usize,
    /// Nodes that delivered a complete reply stream.
    pub replied: usize,
    /// Nodes that errored or timed out. Empty on a clean run.
    pub failed_nodes: Vec<String>,
    /// Rows collected from node replies before consolidation.
    pub collected_rows: u64,
    /// True when the reply was cut at the result-volume cap.
    pub truncated: bool,
    /// Cursor-fetch time accumulated across the job's streams.
    pub fetch: Duration,
    /// Transport wait and decode time accumulated across the job's streams.
    pub transport: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct QueryReply {
    pub columns: Vec<ColumnDesc>,
    pub rows: Vec<Row>,
    pub stats: ReplyStats,
}
