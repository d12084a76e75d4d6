//! In-memory tables behind the storage collaborator traits.

use crate::eval;
use async_trait::async_trait;
use floe_common::{
    CellValue, ColumnDesc, ColumnType, Cursor, Error, Result, ResultBatch, Row, StorageEngine,
};
use sqlparser::ast::{ObjectType, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub(crate) struct MemTable {
    pub columns: Vec<ColumnDesc>,
    pub rows: Vec<Row>,
}

/// A set of named in-memory tables. Cheap to clone handles around via `Arc`.
#[derive(Default)]
pub struct MemoryEngine {
    tables: Mutex<HashMap<String, MemTable>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table directly, bypassing DDL. Test setup helper.
    pub fn load(&self, table: &str, columns: Vec<ColumnDesc>, rows: Vec<Row>) {
        let mut tables = self.lock();
        tables.insert(table.to_lowercase(), MemTable { columns, rows });
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .get(&table.to_lowercase())
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemTable>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            // A panicked writer cannot leave a table half-updated; the map
            // itself is still consistent.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open(&self, query: &str) -> Result<Box<dyn Cursor>> {
        let statements = Parser::parse_sql(&GenericDialect {}, query)?;
        let statement = statements
            .first()
            .ok_or_else(|| Error::MalformedQuery("empty statement".to_string()))?;
        let q = match statement {
            Statement::Query(q) => q,
            other => {
                return Err(Error::MalformedQuery(format!("not a query: {}", other)));
            }
        };
        let table_name = eval::source_table(q)?;
        let table = self
            .lock()
            .get(&table_name)
            .cloned()
            .ok_or_else(|| Error::Fetch(format!("no such table: {}", table_name)))?;
        let (columns, rows) = eval::eval_query(&table, q)?;
        Ok(Box::new(MemCursor::new(columns, rows)))
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<()> {
        let statements = Parser::parse_sql(&GenericDialect {}, ddl)?;
        for statement in statements {
            match statement {
                Statement::CreateTable(create) => {
                    let name = create.name.to_string().to_lowercase();
                    let columns = create
                        .columns
                        .iter()
                        .map(|col| {
                            ColumnDesc::new(
                                col.name.value.to_lowercase(),
                                column_type_from_sql(&col.data_type.to_string()),
                            )
                        })
                        .collect();
                    self.lock().insert(name, MemTable { columns, rows: Vec::new() });
                }
                Statement::Drop { object_type: ObjectType::Table, names, .. } => {
                    let mut tables = self.lock();
                    for name in names {
                        tables.remove(&name.to_string().to_lowercase());
                    }
                }
                other => {
                    return Err(Error::MalformedQuery(format!("unsupported DDL: {}", other)));
                }
            }
        }
        Ok(())
    }

    async fn insert(&self, table: &str, batch: &ResultBatch) -> Result<()> {
        let mut tables = self.lock();
        let target = tables
            .get_mut(&table.to_lowercase())
            .ok_or_else(|| Error::Internal(format!("no such table: {}", table)))?;
        // Align by column name; columns absent from the batch become NULL.
        let indices: Vec<Option<usize>> = target
            .columns
            .iter()
            .map(|c| {
                batch
                    .columns
                    .iter()
                    .position(|b| b.name.eq_ignore_ascii_case(&c.name))
            })
            .collect();
        for row in &batch.rows {
            let aligned: Row = indices
                .iter()
                .map(|idx| {
                    idx.and_then(|i| row.get(i).cloned())
                        .unwrap_or(CellValue::Null)
                })
                .collect();
            target.rows.push(aligned);
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.lock().remove(&table.to_lowercase());
        Ok(())
    }
}

fn column_type_from_sql(sql_type: &str) -> ColumnType {
    let t = sql_type.to_uppercase();
    if t.contains("INT") {
        ColumnType::Int
    } else if t.contains("DOUBLE") || t.contains("FLOAT") || t.contains("REAL") || t.contains("NUMERIC") {
        ColumnType::Float
    } else if t.contains("BOOL") {
        ColumnType::Bool
    } else if t.contains("TIMESTAMP") || t.contains("DATETIME") {
        ColumnType::Timestamp
    } else {
        ColumnType::Text
    }
}

/// Cursor over a fully materialized result. Batches out `batch_size` rows per
/// fetch so streaming behavior upstream stays realistic.
pub struct MemCursor {
    columns: Vec<ColumnDesc>,
    rows: Vec<Row>,
    pos: usize,
    sequence: u64,
}

impl MemCursor {
    pub fn new(columns: Vec<ColumnDesc>, rows: Vec<Row>) -> Self {
        Self { columns, rows, pos: 0, sequence: 0 }
    }
}

#[async_trait]
impl Cursor for MemCursor {
    async fn fetch_next(&mut self, batch_size: usize) -> Result<Option<ResultBatch>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.pos + batch_size.max(1)).min(self.rows.len());
        let rows = self.rows[self.pos..end].to_vec();
        self.pos = end;
        let batch = ResultBatch {
            node_id: "memory".to_string(),
            sequence: self.sequence,
            last: self.pos >= self.rows.len(),
            columns: self.columns.clone(),
            rows,
        };
        self.sequence += 1;
        Ok(Some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_readings() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.load(
            "readings",
            vec![
                ColumnDesc::new("city", ColumnType::Text),
                ColumnDesc::new("value", ColumnType::Int),
            ],
            vec![
                vec![CellValue::Text("oslo".to_string()), CellValue::Int(10)],
                vec![CellValue::Text("oslo".to_string()), CellValue::Int(20)],
                vec![CellValue::Text("bergen".to_string()), CellValue::Int(5)],
            ],
        );
        engine
    }

    async fn all_rows(cursor: &mut Box<dyn Cursor>) -> Vec<Row> {
        let mut rows = Vec::new();
        while let Some(batch) = cursor.fetch_next(2).await.unwrap() {
            rows.extend(batch.rows);
        }
        rows
    }

    #[tokio::test]
    async fn ddl_round_trip() {
        let engine = MemoryEngine::new();
        engine
            .execute_ddl("CREATE TABLE t (a BIGINT, b DOUBLE PRECISION, c TEXT)")
            .await
            .unwrap();
        assert_eq!(engine.table_names(), vec!["t".to_string()]);
        engine.execute_ddl("DROP TABLE t").await.unwrap();
        assert!(engine.table_names().is_empty());
    }

    #[tokio::test]
    async fn insert_aligns_by_name() {
        let engine = MemoryEngine::new();
        engine.execute_ddl("CREATE TABLE t (a BIGINT, b TEXT)").await.unwrap();
        let batch = ResultBatch {
            node_id: "n1".to_string(),
            sequence: 0,
            last: true,
            // Reversed order relative to the table definition.
            columns: vec![
                ColumnDesc::new("b", ColumnType::Text),
                ColumnDesc::new("a", ColumnType::Int),
            ],
            rows: vec![vec![CellValue::Text("x".to_string()), CellValue::Int(1)]],
        };
        engine.insert("t", &batch).await.unwrap();
        let mut cursor = engine.open("SELECT a, b FROM t").await.unwrap();
        let rows = all_rows(&mut cursor).await;
        assert_eq!(rows, vec![vec![CellValue::Int(1), CellValue::Text("x".to_string())]]);
    }

    #[tokio::test]
    async fn filtered_aggregate_query() {
        let engine = engine_with_readings();
        let mut cursor = engine
            .open("SELECT city, SUM(value) AS sum_value FROM readings WHERE value > 4 GROUP BY city ORDER BY city")
            .await
            .unwrap();
        let rows = all_rows(&mut cursor).await;
        assert_eq!(
            rows,
            vec![
                vec![CellValue::Text("bergen".to_string()), CellValue::Int(5)],
                vec![CellValue::Text("oslo".to_string()), CellValue::Int(30)],
            ]
        );
    }

    #[tokio::test]
    async fn unknown_table_is_a_fetch_error() {
        let engine = MemoryEngine::new();
        let err = engine.open("SELECT a FROM missing").await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)));
    }

    #[tokio::test]
    async fn cursor_batches_and_flags_the_last() {
        let engine = engine_with_readings();
        let mut cursor = engine.open("SELECT city, value FROM readings").await.unwrap();
        let first = cursor.fetch_next(2).await.unwrap().unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(!first.last);
        let second = cursor.fetch_next(2).await.unwrap().unwrap();
        assert_eq!(second.rows.len(), 1);
        assert!(second.last);
        assert!(cursor.fetch_next(2).await.unwrap().is_none());
    }
}
