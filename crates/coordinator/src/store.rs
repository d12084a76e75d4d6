//! Job-scoped consolidation store.
//!
//! Thin wrapper over the storage collaborator that pins every operation to
//! one job's table. The coordinator drains node replies into it from a single
//! task, so no write ever races another.

use floe_common::{Cursor, Error, Result, ResultBatch, StorageEngine};
use floe_transform::TABLE_TOKEN;
use std::sync::Arc;

pub struct ConsolidationStore {
    storage: Arc<dyn StorageEngine>,
    table: String,
}

impl ConsolidationStore {
    pub fn new(storage: Arc<dyn StorageEngine>, table: impl Into<String>) -> Self {
        Self { storage, table: table.into() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the consolidation table from the transformer's DDL template.
    pub async fn create(&self, ddl_template: &str) -> Result<()> {
        let ddl = ddl_template.replace(TABLE_TOKEN, &self.table);
        self.storage
            .execute_ddl(&ddl)
            .await
            .map_err(|e| Error::ConsolidationDdl(e.to_string()))
    }

    pub async fn insert(&self, batch: &ResultBatch) -> Result<()> {
        self.storage.insert(&self.table, batch).await
    }

    /// Open a cursor over the local aggregation query.
    pub async fn read(&self, local_template: &str) -> Result<Box<dyn Cursor>> {
        let query = local_template.replace(TABLE_TOKEN, &self.table);
        self.storage
            .open(&query)
            .await
            .map_err(|e| Error::LocalQuery(e.to_string()))
    }

    /// Best-effort drop. Runs on every job exit path; a failure is logged
    /// and swallowed so it never masks the job's own outcome.
    pub async fn drop_table(&self) {
        if let Err(e) = self.storage.drop_table(&self.table).await {
            tracing::warn!(table = %self.table, error = %e, "consolidation table drop failed");
        }
    }
}
