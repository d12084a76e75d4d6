//! Distributed query coordination.
//!
//! One `execute` call runs the whole job lifecycle: rewrite, dispatch,
//! reply collection, consolidation, cleanup. Node replies all flow through a
//! single event channel drained by the calling task, so the consolidation
//! table only ever has one writer.

use crate::config::Settings;
use crate::job::DistributedJob;
use crate::reply::{QueryReply, ReplyStats};
use crate::store::ConsolidationStore;
use floe_common::{
    ColumnDesc, Error, QueryObserver, QuerySpec, Result, ResultBatch, Row, SlowQuery,
    StorageEngine, TimingSample, TracingObserver,
};
use floe_stream::{
    open_block, BlockCipher, DispatchTransport, GroupLimiter, RowSink, RowStreamer,
    RowTransforms, StreamOutcome,
};
use floe_transform::{transform, RewritePlan, ANCHOR_TOKEN};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

enum NodeEvent {
    /// The node accepted the dispatched query.
    Accepted(String),
    Batch(String, ResultBatch),
    /// Terminal event per node: the reply's timing sample, or the failure.
    Done(String, Result<TimingSample>),
}

pub struct Coordinator {
    transport: Arc<dyn DispatchTransport>,
    storage: Arc<dyn StorageEngine>,
    observer: Arc<dyn QueryObserver>,
    cipher: Option<Arc<dyn BlockCipher>>,
    settings: Settings,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn DispatchTransport>,
        storage: Arc<dyn StorageEngine>,
        settings: Settings,
    ) -> Self {
        Self {
            transport,
            storage,
            observer: Arc::new(TracingObserver),
            cipher: None,
            settings,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn BlockCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Execute a query across `targets` and consolidate the replies.
    pub async fn execute(&self, spec: &QuerySpec, targets: &[String]) -> Result<QueryReply> {
        self.run(spec, targets, None).await
    }

    /// Like [`execute`](Self::execute), but abandons the job when `cancel`
    /// fires. Dropping the handle without firing it never cancels.
    pub async fn execute_cancellable(
        &self,
        spec: &QuerySpec,
        targets: &[String],
        cancel: oneshot::Receiver<()>,
    ) -> Result<QueryReply> {
        self.run(spec, targets, Some(cancel)).await
    }

    async fn run(
        &self,
        spec: &QuerySpec,
        targets: &[String],
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<QueryReply> {
        if targets.is_empty() {
            return Err(Error::NoReachableNodes);
        }
        let started = Instant::now();
        let mut plan = transform(spec, None)?;
        let mut job = DistributedJob::new(targets);
        info!(
            job = %job.id,
            table = %spec.table,
            targets = targets.len(),
            pass_through = plan.pass_through,
            "dispatching distributed query"
        );

        if let Some(anchor_query) = plan.anchor_query.clone() {
            let anchor = self.resolve_anchor(&anchor_query, targets).await?;
            debug!(job = %job.id, anchor, "anchor resolved");
            let epoch = anchor.to_string();
            plan.remote_query = plan.remote_query.replace(ANCHOR_TOKEN, &epoch);
            plan.local_query = plan.local_query.take().map(|q| q.replace(ANCHOR_TOKEN, &epoch));
        }

        let store = if plan.pass_through {
            None
        } else {
            let store = ConsolidationStore::new(self.storage.clone(), job.table.clone());
            match &plan.local_create {
                Some(ddl) => store.create(ddl).await?,
                None => return Err(Error::Internal("aggregate plan without DDL".to_string())),
            }
            Some(store)
        };

        let result = self
            .collect(spec, &plan, targets, &mut job, store.as_ref(), cancel, started)
            .await;

        // The table is job-scoped; it goes away on success and failure alike.
        if let Some(store) = &store {
            store.drop_table().await;
        }

        match &result {
            Ok(reply) => {
                job.complete();
                info!(
                    job = %job.id,
                    rows = reply.rows.len(),
                    replied = reply.stats.replied,
                    elapsed_ms = reply.stats.elapsed.as_millis() as u64,
                    "job complete"
                );
            }
            Err(Error::NodeTimeout(_)) => job.timed_out(),
            Err(e) => {
                job.failed();
                warn!(job = %job.id, error = %e, "job failed");
            }
        }

        let elapsed = started.elapsed();
        let threshold = self.settings.slow_query_threshold();
        if elapsed > threshold {
            let query = if spec.raw.is_empty() {
                plan.remote_query.clone()
            } else {
                spec.raw.clone()
            };
            self.observer.slow_query(&SlowQuery { query, elapsed, threshold });
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect(
        &self,
        spec: &QuerySpec,
        plan: &RewritePlan,
        targets: &[String],
        job: &mut DistributedJob,
        store: Option<&ConsolidationStore>,
        cancel: Option<oneshot::Receiver<()>>,
        started: Instant,
    ) -> Result<QueryReply> {
        let (tx, mut rx) = mpsc::channel(16);
        let mut tasks = JoinSet::new();
        for node in targets {
            tasks.spawn(collect_node(
                self.transport.clone(),
                self.cipher.clone(),
                node.clone(),
                plan.remote_query.clone(),
                tx.clone(),
            ));
        }
        drop(tx);
        job.collecting();

        let mut transforms = RowTransforms {
            group_limit: spec.per_group_limit.as_ref().map(GroupLimiter::new),
            ..Default::default()
        };
        let cap = self.settings.max_result_rows as usize;
        // Pass-through replies re-apply the query's own row limit over the
        // merged stream; each node honored it only for its own partition.
        let user_limit = if plan.pass_through { spec.limit } else { None };
        let mut accepted = 0usize;
        let mut columns: Vec<ColumnDesc> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        let mut truncated = false;
        let mut fetch = Duration::ZERO;
        let mut transport = Duration::ZERO;

        let deadline = tokio::time::sleep(self.settings.job_deadline());
        tokio::pin!(deadline);
        let cancelled = async move {
            match cancel {
                Some(rx) => {
                    if rx.await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                }
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(NodeEvent::Accepted(_)) => accepted += 1,
                    Some(NodeEvent::Batch(_, mut batch)) => match store {
                        Some(store) => store.insert(&batch).await?,
                        None => {
                            transforms.apply(&mut batch);
                            if columns.is_empty() {
                                columns = batch.columns.clone();
                            }
                            let remaining = cap.saturating_sub(rows.len());
                            if batch.rows.len() > remaining {
                                batch.rows.truncate(remaining);
                                truncated = true;
                            }
                            if let Some(limit) = user_limit {
                                let remaining = limit.saturating_sub(rows.len());
                                batch.rows.truncate(remaining);
                            }
                            rows.extend(batch.rows);
                        }
                    },
                    Some(NodeEvent::Done(node, Ok(timing))) => {
                        self.observer.timing(&timing);
                        fetch += timing.fetch;
                        transport += timing.transport;
                        job.node_succeeded(&node, timing.rows);
                    }
                    Some(NodeEvent::Done(node, Err(e))) => {
                        warn!(job = %job.id, node = %node, error = %e, "node reply failed");
                        job.node_failed(&node, e.to_string());
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    let timed = job.timeout_pending();
                    warn!(job = %job.id, nodes = timed, "job deadline reached");
                    tasks.abort_all();
                    break;
                }
                _ = &mut cancelled => {
                    info!(job = %job.id, "job cancelled");
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
            }
        }

        if accepted == 0 {
            return Err(Error::NoReachableNodes);
        }
        let failed = job.failed_nodes();
        if job.replied() == 0 {
            // Only a deadline expiry is a timeout; a cluster where every node
            // errored is a plain failure.
            let timed = job.timed_out_nodes();
            return match timed.first() {
                Some(node) => Err(Error::NodeTimeout(node.clone())),
                None => Err(Error::PartialFailure(failed)),
            };
        }
        if !failed.is_empty() && self.settings.require_all_nodes {
            return Err(Error::PartialFailure(failed));
        }

        if let (Some(store), Some(local)) = (store, plan.local_query.as_ref()) {
            job.consolidating();
            let cursor = store.read(local).await?;
            let streamer = RowStreamer::new(self.settings.batch_size)
                .fetch_timeout(self.settings.fetch_timeout())
                .max_rows(self.settings.max_result_rows);
            let mut sink = CollectSink::default();
            let (outcome, pump_timing) = streamer.pump(cursor, &mut transforms, &mut sink).await?;
            fetch += pump_timing.fetch;
            transport += pump_timing.transport;
            truncated = outcome == StreamOutcome::VolumeExceeded;
            columns = sink.columns;
            rows = sink.rows;
        }

        Ok(QueryReply {
            columns,
            rows,
            stats: ReplyStats {
                targeted: job.targeted(),
                replied: job.replied(),
                failed_nodes: failed,
                collected_rows: job.row_count(),
                truncated,
                fetch,
                transport,
                elapsed: started.elapsed(),
            },
        })
    }

    /// Run the preliminary anchor lookup against the first node that answers.
    async fn resolve_anchor(&self, query: &str, targets: &[String]) -> Result<i64> {
        for node in targets {
            let mut stream = match self.transport.dispatch(node, query).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(node = %node, error = %e, "anchor lookup dispatch failed");
                    continue;
                }
            };
            let mut anchor = None;
            let mut broken = false;
            while let Some(item) = stream.next().await {
                let batch = match item.and_then(|b| open_block(b, self.cipher.as_deref())) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(node = %node, error = %e, "anchor lookup stream failed");
                        broken = true;
                        break;
                    }
                };
                if anchor.is_none() {
                    anchor = batch.rows.first().and_then(|r| r.first()).and_then(cell_to_epoch);
                }
                if batch.last {
                    break;
                }
            }
            if broken {
                continue;
            }
            if let Some(a) = anchor {
                return Ok(a);
            }
            // The node answered but holds no data; an anchor of zero keeps
            // the buckets aligned across nodes that do.
            return Ok(0);
        }
        Err(Error::NoReachableNodes)
    }
}

fn cell_to_epoch(cell: &floe_common::CellValue) -> Option<i64> {
    use floe_common::CellValue;
    match cell {
        CellValue::Timestamp(ts) => Some(ts.timestamp()),
        CellValue::Int(i) => Some(*i),
        CellValue::Float(f) => Some(*f as i64),
        CellValue::Text(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.timestamp())
            .ok()
            .or_else(|| s.parse().ok()),
        _ => None,
    }
}

/// Drain one node's reply stream into the job event channel. Every path ends
/// with exactly one `Done` event for the node. Time spent waiting on and
/// decoding blocks accumulates into the node's transport counter.
async fn collect_node(
    transport: Arc<dyn DispatchTransport>,
    cipher: Option<Arc<dyn BlockCipher>>,
    node: String,
    query: String,
    tx: mpsc::Sender<NodeEvent>,
) {
    let mut stream = match transport.dispatch(&node, &query).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send(NodeEvent::Done(node, Err(e))).await;
            return;
        }
    };
    if tx.send(NodeEvent::Accepted(node.clone())).await.is_err() {
        return;
    }
    let mut timing = TimingSample { node_id: node.clone(), ..Default::default() };
    loop {
        let waited = Instant::now();
        let outcome = match stream.next().await {
            Some(item) => item.and_then(|b| open_block(b, cipher.as_deref())),
            None => Err(Error::Network(
                "reply stream ended without terminal block".to_string(),
            )),
        };
        timing.transport += waited.elapsed();
        match outcome {
            Ok(batch) => {
                timing.rows += batch.rows.len() as u64;
                let last = batch.last;
                if !batch.rows.is_empty()
                    && tx.send(NodeEvent::Batch(node.clone(), batch)).await.is_err()
                {
                    return;
                }
                if last {
                    let _ = tx.send(NodeEvent::Done(node, Ok(timing))).await;
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(NodeEvent::Done(node, Err(e))).await;
                return;
            }
        }
    }
}

#[derive(Default)]
struct CollectSink {
    columns: Vec<ColumnDesc>,
    rows: Vec<Row>,
}

#[async_trait::async_trait]
impl RowSink for CollectSink {
    async fn deliver(&mut self, batch: ResultBatch) -> Result<()> {
        if self.columns.is_empty() {
            self.columns = batch.columns;
        }
        self.rows.extend(batch.rows);
        Ok(())
    }
}
