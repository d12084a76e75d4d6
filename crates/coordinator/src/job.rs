//! Distributed job bookkeeping.

use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle of one distributed query job.
///
/// Collecting and Consolidating only move forward; every job ends in exactly
/// one of the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Dispatched,
    Collecting,
    Consolidating,
    Complete,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Success,
    Error(String),
    Timeout,
}

/// One in-flight distributed query: its id, per-node reply ledger and the
/// job-scoped consolidation table name.
#[derive(Debug)]
pub struct DistributedJob {
    pub id: Uuid,
    pub state: JobState,
    pub table: String,
    replies: HashMap<String, NodeStatus>,
    row_count: u64,
}

impl DistributedJob {
    pub fn new(targets: &[String]) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            state: JobState::Dispatched,
            table: format!("floe_job_{}", id.simple()),
            replies: targets
                .iter()
                .map(|n| (n.clone(), NodeStatus::Pending))
                .collect(),
            row_count: 0,
        }
    }

    pub fn collecting(&mut self) {
        self.state = JobState::Collecting;
    }

    pub fn consolidating(&mut self) {
        self.state = JobState::Consolidating;
    }

    pub fn complete(&mut self) {
        self.state = JobState::Complete;
    }

    pub fn failed(&mut self) {
        self.state = JobState::Failed;
    }

    pub fn timed_out(&mut self) {
        self.state = JobState::TimedOut;
    }

    pub fn node_succeeded(&mut self, node: &str, rows: u64) {
        self.replies.insert(node.to_string(), NodeStatus::Success);
        self.row_count += rows;
    }

    pub fn node_failed(&mut self, node: &str, reason: String) {
        self.replies.insert(node.to_string(), NodeStatus::Error(reason));
    }

    /// Time out every node still pending. Returns how many were affected.
    pub fn timeout_pending(&mut self) -> usize {
        let mut hit = 0;
        for status in self.replies.values_mut() {
            if *status == NodeStatus::Pending {
                *status = NodeStatus::Timeout;
                hit += 1;
            }
        }
        hit
    }

    pub fn targeted(&self) -> usize {
        self.replies.len()
    }

    pub fn replied(&self) -> usize {
        self.replies
            .values()
            .filter(|s| **s == NodeStatus::Success)
            .count()
    }

    /// Nodes that did not deliver a complete reply, sorted for stable output.
    pub fn failed_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .replies
            .iter()
            .filter(|(_, s)| !matches!(s, NodeStatus::Success))
            .map(|(n, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Nodes marked timed out by the job deadline, sorted for stable output.
    pub fn timed_out_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .replies
            .iter()
            .filter(|(_, s)| matches!(s, NodeStatus::Timeout))
            .map(|(n, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }
}
