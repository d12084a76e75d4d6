//! Self-describing record codec.
//!
//! Each row becomes one newline-delimited record of column name/value pairs:
//! strings quoted, numerics unquoted, booleans as literal `true`/`false`,
//! timestamps as quoted RFC 3339. The receiving side retypes values from the
//! column descriptors carried in the block header.

use chrono::{DateTime, Utc};
use floe_common::{CellValue, ColumnDesc, ColumnType, Error, Result, Row};
use serde_json::{Map, Number, Value};

pub fn encode_row(columns: &[ColumnDesc], row: &Row) -> Result<Vec<u8>> {
    let mut record = Map::with_capacity(columns.len());
    for (desc, cell) in columns.iter().zip(row.iter()) {
        record.insert(desc.name.clone(), cell_to_json(cell));
    }
    let mut bytes = serde_json::to_vec(&Value::Object(record))
        .map_err(|e| Error::Internal(format!("record encode: {}", e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_rows(columns: &[ColumnDesc], payload: &[u8]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for line in payload.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_slice(line)
            .map_err(|e| Error::Network(format!("bad record: {}", e)))?;
        let record = value
            .as_object()
            .ok_or_else(|| Error::Network("record is not an object".to_string()))?;
        let mut row = Vec::with_capacity(columns.len());
        for desc in columns {
            let v = record.get(&desc.name).unwrap_or(&Value::Null);
            row.push(json_to_cell(v, desc)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn cell_to_json(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Int(i) => Value::Number((*i).into()),
        // NaN/inf have no JSON rendering; they degrade to null.
        CellValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        CellValue::Text(s) => Value::String(s.clone()),
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
    }
}

fn json_to_cell(v: &Value, desc: &ColumnDesc) -> Result<CellValue> {
    if v.is_null() {
        return Ok(CellValue::Null);
    }
    let mismatch = || Error::Network(format!("column {}: unexpected value {}", desc.name, v));
    match desc.data_type {
        ColumnType::Int => v
            .as_i64()
            .map(CellValue::Int)
            .or_else(|| v.as_f64().map(|f| CellValue::Int(f as i64)))
            .ok_or_else(mismatch),
        ColumnType::Float => v.as_f64().map(CellValue::Float).ok_or_else(mismatch),
        ColumnType::Bool => v.as_bool().map(CellValue::Bool).ok_or_else(mismatch),
        ColumnType::Text => match v {
            Value::String(s) => Ok(CellValue::Text(s.clone())),
            other => Ok(CellValue::Text(other.to_string())),
        },
        ColumnType::Timestamp => {
            let s = v.as_str().ok_or_else(mismatch)?;
            DateTime::parse_from_rfc3339(s)
                .map(|ts| CellValue::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|_| mismatch())
        }
    }
}
