//! Observability collaborator: timing samples and slow-query reporting.

use std::time::Duration;

/// Per-node timing collected by the row streamer.
#[derive(Debug, Clone, Default)]
pub struct TimingSample {
    pub node_id: String,
    /// Time spent waiting on cursor fetches.
    pub fetch: Duration,
    /// Time spent waiting on transport sends/receives.
    pub transport: Duration,
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct SlowQuery {
    pub query: String,
    pub elapsed: Duration,
    pub threshold: Duration,
}

pub trait QueryObserver: Send + Sync {
    fn timing(&self, sample: &TimingSample);

    /// Called only when a query's elapsed time crosses the configured
    /// threshold; the gate lives with the caller, not the observer.
    fn slow_query(&self, entry: &SlowQuery);
}

/// Default observer that forwards samples to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl QueryObserver for TracingObserver {
    fn timing(&self, sample: &TimingSample) {
        tracing::debug!(
            node = %sample.node_id,
            fetch_us = sample.fetch.as_micros() as u64,
            transport_us = sample.transport.as_micros() as u64,
            rows = sample.rows,
            "stream timing"
        );
    }

    fn slow_query(&self, entry: &SlowQuery) {
        tracing::warn!(
            elapsed_ms = entry.elapsed.as_millis() as u64,
            threshold_ms = entry.threshold.as_millis() as u64,
            query = %entry.query,
            "slow query"
        );
    }
}
