//! Typed rows and result batches exchanged between nodes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Column types understood by the engine. Storage collaborators map these
/// onto whatever their backing DBMS supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
}

impl ColumnType {
    /// SQL type name used in consolidation-table DDL.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Int => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }
}

/// A single cell value. Timestamps are carried in UTC; timezone conversion
/// is a receive-side transform.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of the cell, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn data_type(&self) -> Option<ColumnType> {
        match self {
            CellValue::Null => None,
            CellValue::Int(_) => Some(ColumnType::Int),
            CellValue::Float(_) => Some(ColumnType::Float),
            CellValue::Text(_) => Some(ColumnType::Text),
            CellValue::Bool(_) => Some(ColumnType::Bool),
            CellValue::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    /// Total order used for ORDER BY and MIN/MAX over mixed batches.
    /// Nulls sort first; numerics compare by value across Int/Float.
    pub fn compare(&self, other: &CellValue) -> Ordering {
        use CellValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => self.to_string().cmp(&other.to_string()),
            },
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, ""),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Text(s) => write!(f, "{}", s),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Timestamp(ts) => {
                write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }
}

/// Name and type of one output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub data_type: ColumnType,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self { name: name.into(), data_type }
    }
}

pub type Row = Vec<CellValue>;

/// An ordered slice of typed rows from one node's reply stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultBatch {
    pub node_id: String,
    /// Block sequence number within the originating stream.
    pub sequence: u64,
    /// Terminal-block flag: no further batches follow from this node.
    pub last: bool,
    pub columns: Vec<ColumnDesc>,
    pub rows: Vec<Row>,
}

impl ResultBatch {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}
