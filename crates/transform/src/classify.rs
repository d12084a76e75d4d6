//! Projection classification.
//!
//! Each projection expression is resolved to exactly one [`AggregateKind`].
//! A spec may tag its projections up front; untagged expressions of the form
//! `func(args)` are classified by function name here.

use floe_common::{AggregateKind, Error, Projection, Result};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Select, SelectItem, SetExpr, Statement,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// A projection with its resolved kind and unwrapped inner expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: AggregateKind,
    /// The expression inside the aggregate call, or the whole expression for
    /// passthrough projections.
    pub inner: String,
    pub alias: Option<String>,
}

/// Aggregate-like functions we recognize but cannot decompose across
/// arbitrary partitions.
const NOT_DECOMPOSABLE: &[&str] = &[
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "variance",
    "var_pop",
    "var_samp",
    "median",
    "percentile",
    "mode",
];

pub fn classify_projection(p: &Projection) -> Result<Classified> {
    if p.kind.is_aggregate() {
        return Ok(Classified { kind: p.kind, inner: p.expr.clone(), alias: p.alias.clone() });
    }

    let expr = parse_expr(&p.expr)?;
    let (kind, inner) = match &expr {
        Expr::Function(f) => {
            let name = f.name.to_string().to_lowercase();
            if NOT_DECOMPOSABLE.contains(&name.as_str()) {
                return Err(Error::UnsupportedFunction(name));
            }
            let distinct = matches!(
                &f.args,
                FunctionArguments::List(l) if l.duplicate_treatment
                    == Some(sqlparser::ast::DuplicateTreatment::Distinct)
            );
            let kind = match name.as_str() {
                "count" if distinct => Some(AggregateKind::CountDistinct),
                "count" => Some(AggregateKind::Count),
                "sum" => Some(AggregateKind::Sum),
                "avg" => Some(AggregateKind::Avg),
                "min" => Some(AggregateKind::Min),
                "max" => Some(AggregateKind::Max),
                "range" => Some(AggregateKind::Range),
                "increments" => Some(AggregateKind::Increments),
                "period" => Some(AggregateKind::Period),
                _ => None,
            };
            match kind {
                Some(k) => (k, first_argument(f)?),
                // Unrecognized scalar function: passes through untouched.
                None => (AggregateKind::None, p.expr.clone()),
            }
        }
        _ => (AggregateKind::None, p.expr.clone()),
    };
    Ok(Classified { kind, inner, alias: p.alias.clone() })
}

/// Parse one expression by planting it in a dummy SELECT.
pub fn parse_expr(expr: &str) -> Result<Expr> {
    let sql = format!("SELECT {} FROM floe_probe", expr);
    let select = parse_single_select(&sql)
        .map_err(|e| Error::MalformedQuery(format!("bad projection `{}`: {}", expr, e)))?;
    match select.projection.into_iter().next() {
        Some(SelectItem::UnnamedExpr(e)) | Some(SelectItem::ExprWithAlias { expr: e, .. }) => Ok(e),
        _ => Err(Error::MalformedQuery(format!("bad projection `{}`", expr))),
    }
}

/// Parse a filter predicate in isolation.
pub fn parse_predicate(filter: &str) -> Result<Expr> {
    let sql = format!("SELECT 1 FROM floe_probe WHERE {}", filter);
    let select = parse_single_select(&sql)
        .map_err(|e| Error::MalformedQuery(format!("bad predicate `{}`: {}", filter, e)))?;
    select
        .selection
        .ok_or_else(|| Error::MalformedQuery(format!("bad predicate `{}`", filter)))
}

fn parse_single_select(sql: &str) -> std::result::Result<Select, String> {
    let statements =
        Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| e.to_string())?;
    match statements.into_iter().next() {
        Some(Statement::Query(q)) => match *q.body {
            SetExpr::Select(s) => Ok(*s),
            _ => Err("expected a SELECT".to_string()),
        },
        _ => Err("expected a single query".to_string()),
    }
}

fn first_argument(f: &sqlparser::ast::Function) -> Result<String> {
    if let FunctionArguments::List(l) = &f.args {
        for arg in &l.args {
            match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => return Ok(e.to_string()),
                FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => return Ok("*".to_string()),
                _ => {}
            }
        }
    }
    Err(Error::MalformedQuery(format!("aggregate `{}` has no argument", f.name)))
}

/// Collect column identifiers referenced by an expression.
pub fn collect_columns(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Identifier(id) => out.push(id.value.clone()),
        Expr::CompoundIdentifier(ids) => {
            if let Some(last) = ids.last() {
                out.push(last.value.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_columns(left, out);
            collect_columns(right, out);
        }
        Expr::UnaryOp { expr, .. } => collect_columns(expr, out),
        Expr::Nested(e) => collect_columns(e, out),
        Expr::Cast { expr, .. } => collect_columns(expr, out),
        Expr::IsNull(e) | Expr::IsNotNull(e) => collect_columns(e, out),
        Expr::Between { expr, low, high, .. } => {
            collect_columns(expr, out);
            collect_columns(low, out);
            collect_columns(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_columns(expr, out);
            for e in list {
                collect_columns(e, out);
            }
        }
        Expr::Function(f) => {
            if let FunctionArguments::List(l) = &f.args {
                for arg in &l.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) = arg {
                        collect_columns(e, out);
                    }
                }
            }
        }
        _ => {}
    }
}
