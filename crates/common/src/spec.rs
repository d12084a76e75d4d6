//! The structured query specification handed in by the command/API layer.
//!
//! A [`QuerySpec`] is immutable once constructed: the transformer reads it and
//! produces a rewrite plan without ever mutating the spec.

use chrono::{DateTime, Utc};

/// Closed set of aggregate kinds the engine can decompose across nodes.
///
/// Every kind has exactly one decomposition handler in the transformer, so
/// adding a variant here fails to compile until the handler exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// Plain passthrough column or scalar expression.
    None,
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    /// ABS(MAX - MIN) over the whole consolidated set.
    Range,
    /// Sum of per-row deltas within each node's own ordered sequence.
    Increments,
    /// Fixed time-window bucketing against a resolved anchor timestamp.
    Period,
}

impl AggregateKind {
    /// Tag combined with the source expression to name consolidation columns.
    pub fn tag(&self) -> &'static str {
        match self {
            AggregateKind::None => "",
            AggregateKind::Count => "count",
            AggregateKind::CountDistinct => "raw",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Range => "range",
            AggregateKind::Increments => "incr",
            AggregateKind::Period => "period",
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, AggregateKind::None)
    }
}

/// One projected output column.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Source expression, e.g. `value` or the inner expression of `avg(value)`.
    pub expr: String,
    pub kind: AggregateKind,
    /// Output alias; defaults to a name derived from kind and expression.
    pub alias: Option<String>,
}

impl Projection {
    pub fn column(expr: impl Into<String>) -> Self {
        Self { expr: expr.into(), kind: AggregateKind::None, alias: None }
    }

    pub fn aggregate(kind: AggregateKind, expr: impl Into<String>) -> Self {
        Self { expr: expr.into(), kind, alias: None }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self { column: column.into(), descending: false }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self { column: column.into(), descending: true }
    }
}

/// Per-group row cap applied on the receive side of the streamer.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLimit {
    pub columns: Vec<String>,
    pub limit: usize,
}

/// Fixed time-window bucketing for PERIOD queries.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBucket {
    /// Temporal column the windows are laid over.
    pub column: String,
    pub interval_secs: i64,
    /// Window anchor. When unset the transformer emits a preliminary
    /// lookup query and the coordinator resolves the anchor before dispatch.
    pub anchor: Option<DateTime<Utc>>,
}

/// A parsed user query. Owned by the call that produced it, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    /// Original query text, kept for diagnostics and slow-query logging.
    pub raw: String,
    pub table: String,
    pub projections: Vec<Projection>,
    /// Filter predicate, verbatim SQL.
    pub filter: Option<String>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub per_group_limit: Option<GroupLimit>,
    pub time_bucket: Option<TimeBucket>,
}

impl QuerySpec {
    /// Minimal spec over one table; callers fill in the remaining fields.
    pub fn new(table: impl Into<String>, projections: Vec<Projection>) -> Self {
        let table = table.into();
        Self {
            raw: String::new(),
            table,
            projections,
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            per_group_limit: None,
            time_bucket: None,
        }
    }

    pub fn has_aggregate(&self) -> bool {
        self.projections.iter().any(|p| p.kind.is_aggregate())
    }
}
