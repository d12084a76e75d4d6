//! Per-group row-count limiting.

use floe_common::{ColumnDesc, GroupLimit, Row};
use std::collections::HashMap;

/// Counts rows per group key and drops rows beyond the configured limit.
/// Dropped rows are silent, never an error. At the boundary the policy is
/// stable input order: the first `limit` rows to arrive for a group win.
pub struct GroupLimiter {
    columns: Vec<String>,
    limit: usize,
    counts: HashMap<String, usize>,
}

impl GroupLimiter {
    pub fn new(spec: &GroupLimit) -> Self {
        Self { columns: spec.columns.clone(), limit: spec.limit, counts: HashMap::new() }
    }

    /// True when the row is within its group's budget.
    pub fn admit(&mut self, columns: &[ColumnDesc], row: &Row) -> bool {
        let key = self
            .columns
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
                    .and_then(|i| row.get(i))
                    .map(|cell| cell.to_string())
                    .unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let seen = self.counts.entry(key).or_insert(0);
        if *seen >= self.limit {
            false
        } else {
            *seen += 1;
            true
        }
    }
}
