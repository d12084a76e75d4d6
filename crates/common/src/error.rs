use sqlparser::parser::ParserError;
use thiserror::Error;

/// Unified error type for Floe crates.
#[derive(Debug, Error)]
pub enum Error {
    // Transformer errors. The query is never dispatched when one of these fires.
    #[error("malformed query: {0}")]
    MalformedQuery(String),
    #[error("aggregate function cannot be decomposed: {0}")]
    UnsupportedFunction(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    // Coordinator errors.
    #[error("no target node accepted the query")]
    NoReachableNodes,
    #[error("node timed out: {0}")]
    NodeTimeout(String),
    #[error("nodes failed to reply: {0:?}")]
    PartialFailure(Vec<String>),
    #[error("consolidation table DDL failed: {0}")]
    ConsolidationDdl(String),
    #[error("local aggregation query failed: {0}")]
    LocalQuery(String),

    // Streamer errors.
    #[error("cursor fetch failed: {0}")]
    Fetch(String),
    #[error("transport send failed: {0}")]
    Network(String),
    #[error("block encryption setup failed: {0}")]
    Encryption(String),
    #[error("result volume limit exceeded")]
    VolumeExceeded,
    #[error("query time limit exceeded")]
    QueryTimeLimitExceeded,

    #[error("job cancelled")]
    Cancelled,
    #[error("SQL parsing error: {0}")]
    SqlParser(#[from] ParserError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for transformer errors that reject a query before dispatch.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::MalformedQuery(_) | Error::UnsupportedFunction(_) | Error::UnknownColumn(_)
        )
    }
}
