//! Storage collaborator interface.
//!
//! Physical database engines live outside this workspace; the coordinator and
//! streamer only ever talk to them through these traits. The same collaborator
//! serves both remote result cursors and the consolidation table's DDL,
//! inserts and local-query reads.

use crate::error::Result;
use crate::rows::ResultBatch;
use async_trait::async_trait;

/// Opaque handle over an open query execution against one physical database.
#[async_trait]
pub trait Cursor: Send {
    /// Fetch up to `batch_size` rows. `None` signals end of stream.
    async fn fetch_next(&mut self, batch_size: usize) -> Result<Option<ResultBatch>>;

    /// Release the underlying execution. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

impl std::fmt::Debug for dyn Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cursor")
    }
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Open a cursor over a query result.
    async fn open(&self, query: &str) -> Result<Box<dyn Cursor>>;

    /// Execute CREATE/DROP statements for job-scoped tables.
    async fn execute_ddl(&self, ddl: &str) -> Result<()>;

    /// Append one batch of rows to a table.
    async fn insert(&self, table: &str, batch: &ResultBatch) -> Result<()>;

    /// Drop a table if it exists.
    async fn drop_table(&self, table: &str) -> Result<()>;
}
