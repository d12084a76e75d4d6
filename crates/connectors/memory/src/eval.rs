//! Query evaluation over in-memory tables.
//!
//! Covers the SQL shapes the engine's rewrites produce: single-table SELECT
//! with comparison filters, arithmetic, ABS/NULLIF/FLOOR, EXTRACT(EPOCH),
//! the decomposable aggregate functions, GROUP BY, ORDER BY, LIMIT, and the
//! increments deltas shape (a derived table projecting
//! `LAG(expr) OVER ([PARTITION BY ...] ORDER BY ...)` differences). Other
//! window functions and joins are out of scope.

use crate::engine::MemTable;
use floe_common::{CellValue, ColumnDesc, ColumnType, Error, Result, Row};
use sqlparser::ast::{
    BinaryOperator, DateTimeField, DuplicateTreatment, Expr, Function, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, ObjectName, Query, Select,
    SelectItem, SetExpr, TableFactor, UnaryOperator, Value, WindowType,
};
use std::cmp::Ordering;
use std::collections::HashMap;

pub(crate) fn source_table(query: &Query) -> Result<String> {
    let select = select_of(query)?;
    let from = select
        .from
        .first()
        .ok_or_else(|| unsupported("query without FROM"))?;
    match &from.relation {
        TableFactor::Table { name, .. } => Ok(object_name(name)),
        TableFactor::Derived { subquery, .. } => source_table(subquery),
        other => Err(unsupported(&format!("table source {}", other))),
    }
}

pub(crate) fn eval_query(table: &MemTable, query: &Query) -> Result<(Vec<ColumnDesc>, Vec<Row>)> {
    let select = select_of(query)?;
    // A derived table materializes first and the outer select runs over it.
    if let Some(from) = select.from.first() {
        if let TableFactor::Derived { subquery, .. } = &from.relation {
            let (columns, rows) = eval_query(table, subquery)?;
            let derived = MemTable { columns, rows };
            return eval_select(&derived, query);
        }
    }
    eval_select(table, query)
}

fn eval_select(table: &MemTable, query: &Query) -> Result<(Vec<ColumnDesc>, Vec<Row>)> {
    let select = select_of(query)?;

    let mut scanned: Vec<&Row> = Vec::new();
    for row in &table.rows {
        let keep = match &select.selection {
            Some(pred) => truthy(&eval_expr(table, &Scope::Row(row), pred)?),
            None => true,
        };
        if keep {
            scanned.push(row);
        }
    }

    let projections = projection_list(table, select)?;
    let group_exprs: Vec<Expr> = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs.clone(),
        other => return Err(unsupported(&format!("GROUP BY form {:?}", other))),
    };
    let aggregated = projections.iter().any(|(e, _)| contains_aggregate(e));
    let windowed = projections.iter().any(|(e, _)| contains_window(e));

    let mut rows = if aggregated || !group_exprs.is_empty() {
        if windowed {
            return Err(unsupported("window function alongside grouping"));
        }
        eval_grouped(table, &scanned, &group_exprs, &projections)?
    } else if windowed {
        eval_windowed(table, &scanned, &projections)?
    } else {
        let mut out = Vec::with_capacity(scanned.len());
        for row in &scanned {
            let cells: Row = projections
                .iter()
                .map(|(e, _)| eval_expr(table, &Scope::Row(row), e))
                .collect::<Result<_>>()?;
            out.push(cells);
        }
        out
    };

    let names: Vec<String> = projections.iter().map(|(_, n)| n.clone()).collect();
    let columns = infer_columns(&names, &rows);

    if let Some(order_by) = &query.order_by {
        let mut keys = Vec::new();
        for sort in &order_by.exprs {
            if let Some(idx) = output_index(&columns, &sort.expr) {
                keys.push((idx, sort.asc.unwrap_or(true)));
            }
        }
        rows.sort_by(|a, b| {
            for (idx, asc) in &keys {
                let ord = a[*idx].compare(&b[*idx]);
                let ord = if *asc { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    if let Some(limit) = &query.limit {
        let n = match limit {
            Expr::Value(Value::Number(n, _)) => n
                .parse::<usize>()
                .map_err(|_| Error::MalformedQuery(format!("bad LIMIT {}", n)))?,
            other => return Err(unsupported(&format!("LIMIT {}", other))),
        };
        rows.truncate(n);
    }

    Ok((columns, rows))
}

enum Scope<'a> {
    Row(&'a Row),
    /// Group members; identifiers resolve against the first member.
    Group(&'a [&'a Row]),
}

fn eval_grouped(
    table: &MemTable,
    rows: &[&Row],
    group_exprs: &[Expr],
    projections: &[(Expr, String)],
) -> Result<Vec<Row>> {
    let mut order: Vec<Vec<&Row>> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    if group_exprs.is_empty() {
        // Global aggregate: one group, present even over empty input.
        order.push(rows.to_vec());
    } else {
        for row in rows {
            let key: Vec<CellValue> = group_exprs
                .iter()
                .map(|e| eval_expr(table, &Scope::Row(row), e))
                .collect::<Result<_>>()?;
            let sig = key
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("\u{1f}");
            match seen.get(&sig) {
                Some(idx) => order[*idx].push(row),
                None => {
                    seen.insert(sig, order.len());
                    order.push(vec![row]);
                }
            }
        }
    }

    let mut out = Vec::with_capacity(order.len());
    for members in &order {
        let cells: Row = projections
            .iter()
            .map(|(e, _)| eval_expr(table, &Scope::Group(members), e))
            .collect::<Result<_>>()?;
        out.push(cells);
    }
    Ok(out)
}

/// Rows whose projections carry window functions, kept in scan order. Only
/// `LAG(expr) OVER ([PARTITION BY ...] ORDER BY ...)` is understood, the
/// shape the increments deltas subquery projects.
fn eval_windowed(
    table: &MemTable,
    scanned: &[&Row],
    projections: &[(Expr, String)],
) -> Result<Vec<Row>> {
    let mut wanted: Vec<&Function> = Vec::new();
    for (e, _) in projections {
        collect_window_fns(e, &mut wanted);
    }
    let mut values: HashMap<String, Vec<CellValue>> = HashMap::new();
    for f in wanted {
        let key = Expr::Function(f.clone()).to_string();
        if !values.contains_key(&key) {
            values.insert(key, lag_values(table, scanned, f)?);
        }
    }

    let mut out = Vec::with_capacity(scanned.len());
    for (pos, row) in scanned.iter().enumerate() {
        let cells: Row = projections
            .iter()
            .map(|(e, _)| {
                let resolved = replace_windows(e, &values, pos)?;
                eval_expr(table, &Scope::Row(row), &resolved)
            })
            .collect::<Result<_>>()?;
        out.push(cells);
    }
    Ok(out)
}

/// Per-scan-position LAG values: within each partition, rows sort by the
/// window's ORDER BY and each takes the previous row's argument value, the
/// first taking NULL.
fn lag_values(table: &MemTable, scanned: &[&Row], f: &Function) -> Result<Vec<CellValue>> {
    if object_name(&f.name) != "lag" {
        return Err(unsupported(&format!("window function {}", f.name)));
    }
    let arg = single_argument(f)?;
    let spec = match &f.over {
        Some(WindowType::WindowSpec(spec)) => spec,
        _ => return Err(unsupported("named window")),
    };
    if spec.order_by.is_empty() {
        return Err(unsupported("LAG without ORDER BY"));
    }

    let mut partitions: HashMap<String, Vec<usize>> = HashMap::new();
    let mut keys: Vec<Vec<CellValue>> = Vec::with_capacity(scanned.len());
    for (pos, row) in scanned.iter().enumerate() {
        let sig = spec
            .partition_by
            .iter()
            .map(|e| eval_expr(table, &Scope::Row(row), e).map(|c| c.to_string()))
            .collect::<Result<Vec<_>>>()?
            .join("\u{1f}");
        let key: Vec<CellValue> = spec
            .order_by
            .iter()
            .map(|o| eval_expr(table, &Scope::Row(row), &o.expr))
            .collect::<Result<_>>()?;
        keys.push(key);
        partitions.entry(sig).or_default().push(pos);
    }

    let ascending: Vec<bool> = spec.order_by.iter().map(|o| o.asc.unwrap_or(true)).collect();
    let mut out = vec![CellValue::Null; scanned.len()];
    for members in partitions.values() {
        let mut ordered = members.clone();
        ordered.sort_by(|a, b| {
            for (i, asc) in ascending.iter().enumerate() {
                let ord = keys[*a][i].compare(&keys[*b][i]);
                let ord = if *asc { ord } else { ord.reverse() };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        let mut prev = CellValue::Null;
        for pos in ordered {
            let current = eval_expr(table, &Scope::Row(scanned[pos]), arg)?;
            out[pos] = std::mem::replace(&mut prev, current);
        }
    }
    Ok(out)
}

fn collect_window_fns<'a>(expr: &'a Expr, out: &mut Vec<&'a Function>) {
    match expr {
        Expr::Function(f) if f.over.is_some() => out.push(f),
        Expr::BinaryOp { left, right, .. } => {
            collect_window_fns(left, out);
            collect_window_fns(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Floor { expr, .. } => {
            collect_window_fns(expr, out)
        }
        _ => {}
    }
}

/// Substitute each window function with its computed value for this scan
/// position, so the rest of the expression evaluates per row as usual.
fn replace_windows(
    expr: &Expr,
    values: &HashMap<String, Vec<CellValue>>,
    pos: usize,
) -> Result<Expr> {
    match expr {
        Expr::Function(f) if f.over.is_some() => {
            let cell = values
                .get(&expr.to_string())
                .and_then(|v| v.get(pos))
                .cloned()
                .unwrap_or(CellValue::Null);
            window_literal(&cell)
        }
        Expr::BinaryOp { left, op, right } => Ok(Expr::BinaryOp {
            left: Box::new(replace_windows(left, values, pos)?),
            op: op.clone(),
            right: Box::new(replace_windows(right, values, pos)?),
        }),
        Expr::UnaryOp { op, expr } => Ok(Expr::UnaryOp {
            op: *op,
            expr: Box::new(replace_windows(expr, values, pos)?),
        }),
        Expr::Nested(e) => Ok(Expr::Nested(Box::new(replace_windows(e, values, pos)?))),
        other => Ok(other.clone()),
    }
}

fn window_literal(cell: &CellValue) -> Result<Expr> {
    match cell {
        CellValue::Null => Ok(Expr::Value(Value::Null)),
        CellValue::Int(i) => Ok(Expr::Value(Value::Number(i.to_string(), false))),
        CellValue::Float(f) => Ok(Expr::Value(Value::Number(format!("{:?}", f), false))),
        other => Err(unsupported(&format!("window value {:?}", other))),
    }
}

fn contains_window(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => {
            if f.over.is_some() {
                return true;
            }
            if let FunctionArguments::List(list) = &f.args {
                return list.args.iter().any(|a| {
                    matches!(a, FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) if contains_window(e))
                });
            }
            false
        }
        Expr::BinaryOp { left, right, .. } => contains_window(left) || contains_window(right),
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Floor { expr, .. } => {
            contains_window(expr)
        }
        _ => false,
    }
}

fn eval_expr(table: &MemTable, scope: &Scope<'_>, expr: &Expr) -> Result<CellValue> {
    match expr {
        Expr::Identifier(id) => resolve_column(table, scope, &id.value),
        Expr::CompoundIdentifier(ids) => {
            let id = ids
                .last()
                .ok_or_else(|| unsupported("empty compound identifier"))?;
            resolve_column(table, scope, &id.value)
        }
        Expr::Value(v) => literal(v),
        Expr::Nested(e) => eval_expr(table, scope, e),
        Expr::UnaryOp { op: UnaryOperator::Minus, expr } => {
            match eval_expr(table, scope, expr)? {
                CellValue::Int(i) => Ok(CellValue::Int(-i)),
                CellValue::Float(f) => Ok(CellValue::Float(-f)),
                CellValue::Null => Ok(CellValue::Null),
                other => Err(unsupported(&format!("negation of {:?}", other))),
            }
        }
        Expr::BinaryOp { left, op, right } => binary(table, scope, left, op, right),
        Expr::Function(f) => function(table, scope, f),
        Expr::Floor { expr, .. } => match eval_expr(table, scope, expr)? {
            CellValue::Int(i) => Ok(CellValue::Int(i)),
            CellValue::Float(f) => Ok(CellValue::Int(f.floor() as i64)),
            CellValue::Null => Ok(CellValue::Null),
            other => Err(unsupported(&format!("FLOOR of {:?}", other))),
        },
        Expr::Extract { field: DateTimeField::Epoch, expr, .. } => {
            match eval_expr(table, scope, expr)? {
                CellValue::Timestamp(ts) => Ok(CellValue::Int(ts.timestamp())),
                CellValue::Int(i) => Ok(CellValue::Int(i)),
                CellValue::Float(f) => Ok(CellValue::Int(f as i64)),
                CellValue::Null => Ok(CellValue::Null),
                other => Err(unsupported(&format!("EXTRACT(EPOCH) of {:?}", other))),
            }
        }
        other => Err(unsupported(&format!("expression {}", other))),
    }
}

fn binary(
    table: &MemTable,
    scope: &Scope<'_>,
    left: &Expr,
    op: &BinaryOperator,
    right: &Expr,
) -> Result<CellValue> {
    use BinaryOperator::*;
    match op {
        And => Ok(CellValue::Bool(
            truthy(&eval_expr(table, scope, left)?) && truthy(&eval_expr(table, scope, right)?),
        )),
        Or => Ok(CellValue::Bool(
            truthy(&eval_expr(table, scope, left)?) || truthy(&eval_expr(table, scope, right)?),
        )),
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            let a = eval_expr(table, scope, left)?;
            let b = eval_expr(table, scope, right)?;
            // SQL comparison semantics: NULL never matches.
            if a.is_null() || b.is_null() {
                return Ok(CellValue::Bool(false));
            }
            let ord = a.compare(&b);
            let hit = match op {
                Eq => ord == Ordering::Equal,
                NotEq => ord != Ordering::Equal,
                Lt => ord == Ordering::Less,
                LtEq => ord != Ordering::Greater,
                Gt => ord == Ordering::Greater,
                GtEq => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(CellValue::Bool(hit))
        }
        Plus | Minus | Multiply | Divide => {
            let a = eval_expr(table, scope, left)?;
            let b = eval_expr(table, scope, right)?;
            arithmetic(op, &a, &b)
        }
        other => Err(unsupported(&format!("operator {}", other))),
    }
}

fn arithmetic(op: &BinaryOperator, a: &CellValue, b: &CellValue) -> Result<CellValue> {
    use BinaryOperator::*;
    if a.is_null() || b.is_null() {
        return Ok(CellValue::Null);
    }
    if let (CellValue::Int(x), CellValue::Int(y)) = (a, b) {
        match op {
            Plus => return Ok(CellValue::Int(x + y)),
            Minus => return Ok(CellValue::Int(x - y)),
            Multiply => return Ok(CellValue::Int(x * y)),
            _ => {}
        }
    }
    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(unsupported(&format!("arithmetic on {:?} and {:?}", a, b))),
    };
    let v = match op {
        Plus => x + y,
        Minus => x - y,
        Multiply => x * y,
        Divide => {
            if y == 0.0 {
                return Ok(CellValue::Null);
            }
            x / y
        }
        _ => return Err(unsupported(&format!("operator {}", op))),
    };
    Ok(CellValue::Float(v))
}

fn function(table: &MemTable, scope: &Scope<'_>, f: &Function) -> Result<CellValue> {
    if f.over.is_some() {
        return Err(unsupported("window functions"));
    }
    let name = object_name(&f.name);
    match name.as_str() {
        "count" | "sum" | "avg" | "min" | "max" => match scope {
            Scope::Group(members) => aggregate(table, members, f, &name),
            Scope::Row(_) => Err(unsupported(&format!("aggregate {} outside grouping", name))),
        },
        "abs" => {
            let arg = single_argument(f)?;
            match eval_expr(table, scope, arg)? {
                CellValue::Int(i) => Ok(CellValue::Int(i.abs())),
                CellValue::Float(v) => Ok(CellValue::Float(v.abs())),
                CellValue::Null => Ok(CellValue::Null),
                other => Err(unsupported(&format!("ABS of {:?}", other))),
            }
        }
        "nullif" => {
            let (distinct, args) = argument_exprs(f)?;
            if distinct || args.len() != 2 {
                return Err(unsupported("NULLIF arguments"));
            }
            let a = eval_expr(table, scope, args[0].ok_or_else(|| unsupported("NULLIF(*)"))?)?;
            let b = eval_expr(table, scope, args[1].ok_or_else(|| unsupported("NULLIF(*)"))?)?;
            if !a.is_null() && !b.is_null() && a.compare(&b) == Ordering::Equal {
                Ok(CellValue::Null)
            } else {
                Ok(a)
            }
        }
        other => Err(unsupported(&format!("function {}", other))),
    }
}

fn aggregate(
    table: &MemTable,
    members: &[&Row],
    f: &Function,
    name: &str,
) -> Result<CellValue> {
    let (distinct, args) = argument_exprs(f)?;
    let arg = args.first().copied().flatten();

    if name == "count" && arg.is_none() {
        return Ok(CellValue::Int(members.len() as i64));
    }
    let arg = arg.ok_or_else(|| unsupported(&format!("{}(*)", name)))?;

    let mut values = Vec::with_capacity(members.len());
    for member in members {
        let v = eval_expr(table, &Scope::Row(member), arg)?;
        if !v.is_null() {
            values.push(v);
        }
    }

    match name {
        "count" => {
            if distinct {
                let mut seen: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                seen.sort();
                seen.dedup();
                Ok(CellValue::Int(seen.len() as i64))
            } else {
                Ok(CellValue::Int(values.len() as i64))
            }
        }
        "sum" => {
            if values.is_empty() {
                return Ok(CellValue::Null);
            }
            if values.iter().all(|v| matches!(v, CellValue::Int(_))) {
                let mut total = 0i64;
                for v in &values {
                    if let CellValue::Int(i) = v {
                        total += i;
                    }
                }
                Ok(CellValue::Int(total))
            } else {
                let mut total = 0f64;
                for v in &values {
                    total += v
                        .as_f64()
                        .ok_or_else(|| unsupported(&format!("SUM of {:?}", v)))?;
                }
                Ok(CellValue::Float(total))
            }
        }
        "avg" => {
            if values.is_empty() {
                return Ok(CellValue::Null);
            }
            let mut total = 0f64;
            for v in &values {
                total += v
                    .as_f64()
                    .ok_or_else(|| unsupported(&format!("AVG of {:?}", v)))?;
            }
            Ok(CellValue::Float(total / values.len() as f64))
        }
        "min" | "max" => {
            let mut best: Option<CellValue> = None;
            for v in values {
                best = Some(match best {
                    None => v,
                    Some(b) => {
                        let keep_new = if name == "min" {
                            v.compare(&b) == Ordering::Less
                        } else {
                            v.compare(&b) == Ordering::Greater
                        };
                        if keep_new {
                            v
                        } else {
                            b
                        }
                    }
                });
            }
            Ok(best.unwrap_or(CellValue::Null))
        }
        other => Err(unsupported(&format!("aggregate {}", other))),
    }
}

fn argument_exprs(f: &Function) -> Result<(bool, Vec<Option<&Expr>>)> {
    match &f.args {
        FunctionArguments::List(list) => {
            let distinct = list.duplicate_treatment == Some(DuplicateTreatment::Distinct);
            let mut out = Vec::with_capacity(list.args.len());
            for arg in &list.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => out.push(Some(e)),
                    FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => out.push(None),
                    other => return Err(unsupported(&format!("argument {}", other))),
                }
            }
            Ok((distinct, out))
        }
        FunctionArguments::None => Ok((false, Vec::new())),
        FunctionArguments::Subquery(_) => Err(unsupported("subquery argument")),
    }
}

fn single_argument(f: &Function) -> Result<&Expr> {
    let (_, args) = argument_exprs(f)?;
    match args.as_slice() {
        [Some(e)] => Ok(e),
        _ => Err(unsupported(&format!("arguments of {}", f.name))),
    }
}

fn projection_list(table: &MemTable, select: &Select) -> Result<Vec<(Expr, String)>> {
    let mut list = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(e) => list.push((e.clone(), render_name(e))),
            SelectItem::ExprWithAlias { expr, alias } => {
                list.push((expr.clone(), alias.value.to_lowercase()));
            }
            SelectItem::Wildcard(_) => {
                for c in &table.columns {
                    list.push((Expr::Identifier(Ident::new(c.name.clone())), c.name.clone()));
                }
            }
            other => return Err(unsupported(&format!("projection {}", other))),
        }
    }
    if list.is_empty() {
        return Err(unsupported("empty projection"));
    }
    Ok(list)
}

fn resolve_column(table: &MemTable, scope: &Scope<'_>, name: &str) -> Result<CellValue> {
    let idx = table
        .columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::UnknownColumn(name.to_string()))?;
    let cell = match scope {
        Scope::Row(row) => row.get(idx),
        Scope::Group(members) => members.first().and_then(|r| r.get(idx)),
    };
    Ok(cell.cloned().unwrap_or(CellValue::Null))
}

fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(f) => {
            let name = object_name(&f.name);
            if matches!(name.as_str(), "count" | "sum" | "avg" | "min" | "max") {
                return true;
            }
            // Scalar functions can wrap an aggregate, e.g. NULLIF(COUNT(v), 0).
            if let FunctionArguments::List(list) = &f.args {
                for arg in &list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) = arg {
                        if contains_aggregate(e) {
                            return true;
                        }
                    }
                }
            }
            false
        }
        Expr::BinaryOp { left, right, .. } => {
            contains_aggregate(left) || contains_aggregate(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Floor { expr, .. } => {
            contains_aggregate(expr)
        }
        _ => false,
    }
}

fn output_index(columns: &[ColumnDesc], expr: &Expr) -> Option<usize> {
    let wanted = render_name(expr);
    columns.iter().position(|c| c.name.eq_ignore_ascii_case(&wanted))
}

fn render_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(id) => id.value.to_lowercase(),
        Expr::CompoundIdentifier(ids) => ids
            .last()
            .map(|id| id.value.to_lowercase())
            .unwrap_or_default(),
        other => other.to_string().to_lowercase(),
    }
}

fn infer_columns(names: &[String], rows: &[Row]) -> Vec<ColumnDesc> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let ty = rows
                .iter()
                .filter_map(|r| r.get(i))
                .filter_map(|c| c.data_type())
                .next()
                .unwrap_or(ColumnType::Text);
            ColumnDesc::new(name.clone(), ty)
        })
        .collect()
}

fn literal(v: &Value) -> Result<CellValue> {
    match v {
        Value::Number(n, _) => {
            if n.contains('.') || n.contains('e') || n.contains('E') {
                n.parse::<f64>()
                    .map(CellValue::Float)
                    .map_err(|_| Error::MalformedQuery(format!("bad number {}", n)))
            } else {
                n.parse::<i64>()
                    .map(CellValue::Int)
                    .map_err(|_| Error::MalformedQuery(format!("bad number {}", n)))
            }
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
            Ok(CellValue::Text(s.clone()))
        }
        Value::Boolean(b) => Ok(CellValue::Bool(*b)),
        Value::Null => Ok(CellValue::Null),
        other => Err(unsupported(&format!("literal {}", other))),
    }
}

fn truthy(cell: &CellValue) -> bool {
    matches!(cell, CellValue::Bool(true))
}

fn select_of(query: &Query) -> Result<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Ok(select),
        other => Err(unsupported(&format!("query body {}", other))),
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|id| id.value.to_lowercase())
        .unwrap_or_default()
}

fn unsupported(what: &str) -> Error {
    Error::MalformedQuery(format!("unsupported SQL construct: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn run(table: &MemTable, sql: &str) -> (Vec<ColumnDesc>, Vec<Row>) {
        let statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
        let q = match statements.first().unwrap() {
            sqlparser::ast::Statement::Query(q) => q.clone(),
            _ => panic!("not a query"),
        };
        eval_query(table, &q).unwrap()
    }

    fn readings() -> MemTable {
        MemTable {
            columns: vec![
                ColumnDesc::new("city", ColumnType::Text),
                ColumnDesc::new("value", ColumnType::Int),
            ],
            rows: vec![
                vec![CellValue::Text("oslo".to_string()), CellValue::Int(10)],
                vec![CellValue::Text("oslo".to_string()), CellValue::Int(4)],
                vec![CellValue::Text("bergen".to_string()), CellValue::Int(7)],
                vec![CellValue::Text("bergen".to_string()), CellValue::Null],
            ],
        }
    }

    #[test]
    fn global_aggregates_over_empty_input() {
        let table = MemTable { columns: readings().columns, rows: vec![] };
        let (_, rows) = run(&table, "SELECT COUNT(value), SUM(value) FROM readings");
        assert_eq!(rows, vec![vec![CellValue::Int(0), CellValue::Null]]);
    }

    #[test]
    fn count_skips_nulls_but_star_does_not() {
        let table = readings();
        let (_, rows) = run(&table, "SELECT COUNT(*), COUNT(value) FROM readings");
        assert_eq!(rows, vec![vec![CellValue::Int(4), CellValue::Int(3)]]);
    }

    #[test]
    fn avg_guard_divides_sum_by_count() {
        let table = readings();
        let (_, rows) = run(
            &table,
            "SELECT SUM(value) / NULLIF(COUNT(value), 0) AS avg_value FROM readings",
        );
        assert_eq!(rows, vec![vec![CellValue::Float(7.0)]]);
    }

    #[test]
    fn range_shape_evaluates() {
        let table = readings();
        let (_, rows) = run(&table, "SELECT ABS(MAX(value) - MIN(value)) FROM readings");
        assert_eq!(rows, vec![vec![CellValue::Int(6)]]);
    }

    #[test]
    fn count_distinct() {
        let table = readings();
        let (_, rows) = run(&table, "SELECT COUNT(DISTINCT city) FROM readings");
        assert_eq!(rows, vec![vec![CellValue::Int(2)]]);
    }

    #[test]
    fn group_order_limit() {
        let table = readings();
        let (columns, rows) = run(
            &table,
            "SELECT city, SUM(value) AS total FROM readings GROUP BY city ORDER BY total DESC LIMIT 1",
        );
        assert_eq!(columns[1].name, "total");
        assert_eq!(
            rows,
            vec![vec![CellValue::Text("oslo".to_string()), CellValue::Int(14)]]
        );
    }

    #[test]
    fn where_null_never_matches() {
        let table = readings();
        let (_, rows) = run(&table, "SELECT city FROM readings WHERE value > 5");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn epoch_bucketing() {
        let base = Utc.timestamp_opt(1_000, 0).unwrap();
        let table = MemTable {
            columns: vec![
                ColumnDesc::new("ts", ColumnType::Timestamp),
                ColumnDesc::new("v", ColumnType::Int),
            ],
            rows: vec![
                vec![CellValue::Timestamp(base), CellValue::Int(1)],
                vec![
                    CellValue::Timestamp(base + chrono::Duration::seconds(30)),
                    CellValue::Int(2),
                ],
                vec![
                    CellValue::Timestamp(base + chrono::Duration::seconds(90)),
                    CellValue::Int(4),
                ],
            ],
        };
        let (_, rows) = run(
            &table,
            "SELECT FLOOR((EXTRACT(EPOCH FROM ts) - 1000) / 60) AS bucket, SUM(v) AS total \
             FROM t GROUP BY FLOOR((EXTRACT(EPOCH FROM ts) - 1000) / 60) ORDER BY bucket",
        );
        assert_eq!(
            rows,
            vec![
                vec![CellValue::Int(0), CellValue::Int(3)],
                vec![CellValue::Int(1), CellValue::Int(4)],
            ]
        );
    }

    fn counters(rows: Vec<(i64, &str, i64)>) -> MemTable {
        MemTable {
            columns: vec![
                ColumnDesc::new("ts", ColumnType::Int),
                ColumnDesc::new("city", ColumnType::Text),
                ColumnDesc::new("counter", ColumnType::Int),
            ],
            rows: rows
                .into_iter()
                .map(|(ts, city, counter)| {
                    vec![
                        CellValue::Int(ts),
                        CellValue::Text(city.to_string()),
                        CellValue::Int(counter),
                    ]
                })
                .collect(),
        }
    }

    #[test]
    fn lag_deltas_subquery_sums_ordered_differences() {
        let table = counters(vec![(1, "oslo", 10), (2, "oslo", 12), (3, "oslo", 15)]);
        let (_, rows) = run(
            &table,
            "SELECT SUM(delta_counter) AS incr_counter FROM \
             (SELECT counter - LAG(counter) OVER (ORDER BY ts) AS delta_counter \
              FROM readings) AS node_deltas",
        );
        assert_eq!(rows, vec![vec![CellValue::Int(5)]]);
    }

    #[test]
    fn lag_partitions_reset_per_group() {
        // Rows arrive interleaved; LAG orders within each city independently.
        let table = counters(vec![
            (1, "oslo", 1),
            (1, "bergen", 10),
            (2, "oslo", 3),
            (2, "bergen", 14),
        ]);
        let (_, rows) = run(
            &table,
            "SELECT city, SUM(delta_counter) AS incr_counter FROM \
             (SELECT city, counter - LAG(counter) OVER (PARTITION BY city ORDER BY ts) \
              AS delta_counter FROM readings) AS node_deltas \
             GROUP BY city ORDER BY city",
        );
        assert_eq!(
            rows,
            vec![
                vec![CellValue::Text("bergen".to_string()), CellValue::Int(4)],
                vec![CellValue::Text("oslo".to_string()), CellValue::Int(2)],
            ]
        );
    }
}
