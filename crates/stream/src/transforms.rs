//! Receive-side row transforms.
//!
//! Applied to each batch after decoding, in a fixed order: column casts,
//! then timezone rendering, then per-group limiting.

use crate::limit::GroupLimiter;
use chrono::FixedOffset;
use floe_common::{CellValue, ColumnType, ResultBatch};

#[derive(Default)]
pub struct RowTransforms {
    /// Render timestamp columns as text in this offset instead of UTC.
    pub timezone: Option<FixedOffset>,
    /// Per-column target-type casts, by output column name.
    pub casts: Vec<(String, ColumnType)>,
    pub group_limit: Option<GroupLimiter>,
}

impl RowTransforms {
    pub fn is_empty(&self) -> bool {
        self.timezone.is_none() && self.casts.is_empty() && self.group_limit.is_none()
    }

    pub fn apply(&mut self, batch: &mut ResultBatch) {
        for (name, target) in &self.casts {
            if let Some(idx) = batch.column_index(name) {
                batch.columns[idx].data_type = *target;
                for row in &mut batch.rows {
                    if let Some(cell) = row.get_mut(idx) {
                        *cell = cast_cell(cell, *target);
                    }
                }
            }
        }
        if let Some(tz) = self.timezone {
            render_timestamps(batch, tz);
        }
        if let Some(limiter) = &mut self.group_limit {
            let columns = batch.columns.clone();
            batch.rows.retain(|row| limiter.admit(&columns, row));
        }
    }
}

fn render_timestamps(batch: &mut ResultBatch, tz: FixedOffset) {
    let indices: Vec<usize> = batch
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.data_type == ColumnType::Timestamp)
        .map(|(i, _)| i)
        .collect();
    for idx in &indices {
        batch.columns[*idx].data_type = ColumnType::Text;
    }
    for row in &mut batch.rows {
        for idx in &indices {
            if let Some(CellValue::Timestamp(ts)) = row.get(*idx) {
                let local = ts.with_timezone(&tz);
                row[*idx] = CellValue::Text(local.to_rfc3339());
            }
        }
    }
}

fn cast_cell(cell: &CellValue, target: ColumnType) -> CellValue {
    if cell.is_null() {
        return CellValue::Null;
    }
    match target {
        ColumnType::Int => match cell {
            CellValue::Int(i) => CellValue::Int(*i),
            CellValue::Float(f) => CellValue::Int(*f as i64),
            CellValue::Bool(b) => CellValue::Int(*b as i64),
            CellValue::Text(s) => {
                s.parse::<i64>().map(CellValue::Int).unwrap_or(CellValue::Null)
            }
            other => other.clone(),
        },
        ColumnType::Float => match cell {
            CellValue::Float(f) => CellValue::Float(*f),
            CellValue::Int(i) => CellValue::Float(*i as f64),
            CellValue::Text(s) => {
                s.parse::<f64>().map(CellValue::Float).unwrap_or(CellValue::Null)
            }
            other => other.clone(),
        },
        ColumnType::Text => CellValue::Text(cell.to_string()),
        ColumnType::Bool => match cell {
            CellValue::Bool(b) => CellValue::Bool(*b),
            CellValue::Int(i) => CellValue::Bool(*i != 0),
            other => other.clone(),
        },
        ColumnType::Timestamp => cell.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use floe_common::{ColumnDesc, GroupLimit};

    fn batch(columns: Vec<ColumnDesc>, rows: Vec<Vec<CellValue>>) -> ResultBatch {
        ResultBatch { node_id: "n1".to_string(), sequence: 0, last: false, columns, rows }
    }

    #[test]
    fn casts_retype_column_and_cells() {
        let mut b = batch(
            vec![ColumnDesc::new("v", ColumnType::Float)],
            vec![vec![CellValue::Float(3.9)], vec![CellValue::Null]],
        );
        let mut t = RowTransforms {
            casts: vec![("v".to_string(), ColumnType::Int)],
            ..Default::default()
        };
        t.apply(&mut b);
        assert_eq!(b.columns[0].data_type, ColumnType::Int);
        assert_eq!(b.rows[0][0], CellValue::Int(3));
        assert_eq!(b.rows[1][0], CellValue::Null);
    }

    #[test]
    fn timezone_renders_timestamps_as_local_text() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut b = batch(
            vec![ColumnDesc::new("ts", ColumnType::Timestamp)],
            vec![vec![CellValue::Timestamp(ts)]],
        );
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut t = RowTransforms { timezone: Some(offset), ..Default::default() };
        t.apply(&mut b);
        assert_eq!(b.columns[0].data_type, ColumnType::Text);
        match &b.rows[0][0] {
            CellValue::Text(s) => assert!(s.ends_with("+02:00"), "got {}", s),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn group_limit_spans_batches() {
        let cols = vec![ColumnDesc::new("city", ColumnType::Text)];
        let spec = GroupLimit { columns: vec!["city".to_string()], limit: 1 };
        let mut t = RowTransforms {
            group_limit: Some(GroupLimiter::new(&spec)),
            ..Default::default()
        };

        let mut first = batch(cols.clone(), vec![vec![CellValue::Text("oslo".to_string())]]);
        t.apply(&mut first);
        assert_eq!(first.rows.len(), 1);

        let mut second = batch(cols, vec![vec![CellValue::Text("oslo".to_string())]]);
        t.apply(&mut second);
        assert!(second.rows.is_empty());
    }
}
