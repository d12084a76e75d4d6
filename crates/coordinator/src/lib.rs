//! Coordinator crate
//!
//! Drives one distributed query end to end: rewrites the spec into its SQL
//! artifacts, dispatches the remote query, collects node reply streams into
//! the job-scoped consolidation table and runs the local aggregation that
//! produces the final reply.

pub mod config;
pub mod coordinator;
pub mod job;
pub mod reply;
pub mod store;

pub use config::Settings;
pub use coordinator::Coordinator;
pub use job::{DistributedJob, JobState, NodeStatus};
pub use reply::{QueryReply, ReplyStats};
pub use store::ConsolidationStore;
