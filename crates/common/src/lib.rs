//! Common crate
//!
//! Shared types, error taxonomy and collaborator traits for Floe.
//!
//! # Example
//! ```rust
//! use floe_common::{CellValue, ColumnType};
//! assert_eq!(ColumnType::Int.sql_name(), "BIGINT");
//! assert!(CellValue::Null.is_null());
//! ```

pub mod error;
pub mod observe;
pub mod rows;
pub mod spec;
pub mod storage;

pub use error::{Error, Result};
pub use observe::{QueryObserver, SlowQuery, TimingSample, TracingObserver};
pub use rows::{CellValue, ColumnDesc, ColumnType, ResultBatch, Row};
pub use spec::{AggregateKind, GroupLimit, OrderBy, Projection, QuerySpec, TimeBucket};
pub use storage::{Cursor, StorageEngine};
