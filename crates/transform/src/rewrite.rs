//! Rewrite-plan construction.
//!
//! One user query becomes three cooperating SQL artifacts: the remote query
//! every node executes over its own partition, the DDL for the job-scoped
//! consolidation table, and the local query that aggregates the consolidated
//! partial results into the final answer. Queries that need no cross-node
//! aggregation skip the consolidation lifecycle entirely (`pass_through`).

use crate::classify::{classify_projection, collect_columns, parse_expr, parse_predicate, Classified};
use floe_common::{AggregateKind, ColumnDesc, ColumnType, Error, QuerySpec, Result};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// Placeholder for the job-scoped consolidation table name. The coordinator
/// substitutes the real name once the job id exists.
pub const TABLE_TOKEN: &str = "{table}";

/// Placeholder for the PERIOD anchor timestamp (epoch seconds). Substituted
/// by the coordinator after the preliminary anchor lookup resolves.
pub const ANCHOR_TOKEN: &str = "{anchor}";

/// Output of the transformer. Owned by the caller, never mutated.
#[derive(Debug, Clone)]
pub struct RewritePlan {
    pub remote_query: String,
    /// Consolidation-table DDL with [`TABLE_TOKEN`] in place of the name.
    /// Unset iff `pass_through`.
    pub local_create: Option<String>,
    /// Final aggregation query over the consolidation table.
    /// Unset iff `pass_through`.
    pub local_query: Option<String>,
    /// When true, remote output is the final answer.
    pub pass_through: bool,
    /// Preliminary lookup resolving the PERIOD anchor, itself a pass-through
    /// query over the target nodes.
    pub anchor_query: Option<String>,
    /// Consolidation-table column layout, in DDL order.
    pub store_columns: Vec<ColumnDesc>,
}

/// Rewrite a query spec. `schema`, when known, is used to reject unknown
/// columns before dispatch and to type passthrough consolidation columns.
pub fn transform(spec: &QuerySpec, schema: Option<&[ColumnDesc]>) -> Result<RewritePlan> {
    if spec.table.is_empty() || !is_identifier(&spec.table) {
        return Err(Error::MalformedQuery(format!("bad table name `{}`", spec.table)));
    }
    if spec.projections.is_empty() {
        return Err(Error::MalformedQuery("empty projection list".to_string()));
    }
    if let Some(filter) = &spec.filter {
        parse_predicate(filter)?;
    }

    let mut classified: Vec<Classified> =
        spec.projections.iter().map(classify_projection).collect::<Result<_>>()?;

    // Grouping columns not already projected propagate to both queries, in
    // front of the projections and in GROUP BY order.
    let mut at = 0;
    for g in &spec.group_by {
        let present = classified
            .iter()
            .any(|c| c.kind == AggregateKind::None && c.inner.eq_ignore_ascii_case(g));
        if !present {
            classified.insert(at, Classified { kind: AggregateKind::None, inner: g.clone(), alias: None });
            at += 1;
        }
    }

    if let Some(schema) = schema {
        check_columns(spec, &classified, schema)?;
    }

    let has_agg = classified.iter().any(|c| c.kind.is_aggregate());
    let raw_remote = classified.iter().any(|c| c.kind == AggregateKind::CountDistinct);
    let has_increments = classified.iter().any(|c| c.kind == AggregateKind::Increments);
    let has_period = classified.iter().any(|c| c.kind == AggregateKind::Period);

    if has_increments {
        let incompatible = classified.iter().any(|c| {
            c.kind.is_aggregate() && c.kind != AggregateKind::Increments
        });
        if incompatible {
            return Err(Error::UnsupportedFunction(
                "increments cannot be combined with other aggregates".to_string(),
            ));
        }
    }
    if has_period && (raw_remote || has_increments) {
        return Err(Error::UnsupportedFunction(
            "period cannot be combined with count distinct or increments".to_string(),
        ));
    }

    let pass_through = !has_agg
        && spec.group_by.is_empty()
        && spec.order_by.is_empty()
        && spec.per_group_limit.is_none();

    let ctx = Ctx::new(spec, has_agg, raw_remote)?;

    if pass_through {
        let remote = build_pass_through(spec, &classified)?;
        validate_sql(&remote)?;
        debug!(remote = %remote, "pass-through rewrite");
        return Ok(RewritePlan {
            remote_query: remote,
            local_create: None,
            local_query: None,
            pass_through: true,
            anchor_query: None,
            store_columns: Vec::new(),
        });
    }

    let mut parts = Parts::default();
    for c in &classified {
        decompose(c, &ctx, schema, &mut parts)?;
    }

    let remote = assemble_remote(spec, &ctx, &parts);
    let create = assemble_create(&parts);
    let local = assemble_local(spec, &ctx, &parts);

    validate_sql(&strip_tokens(&remote))?;
    validate_sql(&strip_tokens(&create))?;
    validate_sql(&strip_tokens(&local))?;
    if let Some(aq) = &ctx.anchor_query {
        validate_sql(aq)?;
    }
    debug!(remote = %remote, local = %local, "aggregate rewrite");

    Ok(RewritePlan {
        remote_query: remote,
        local_create: Some(create),
        local_query: Some(local),
        pass_through: false,
        anchor_query: ctx.anchor_query,
        store_columns: parts.store,
    })
}

/// Query-level context shared by every projection handler.
struct Ctx {
    has_agg: bool,
    /// COUNT DISTINCT somewhere: the remote query ships raw rows and all
    /// aggregation happens locally, the only partitioning-safe decomposition.
    raw_remote: bool,
    /// Grouping columns plus, in aggregate queries, passthrough projections.
    group: Vec<(String, String)>, // (source expr, sanitized name)
    /// Ordering column for increments deltas.
    incr_order: Option<String>,
    bucket: Option<BucketCtx>,
    anchor_query: Option<String>,
}

struct BucketCtx {
    interval_secs: i64,
    /// Epoch-seconds literal, or [`ANCHOR_TOKEN`] until resolved.
    anchor: String,
}

impl Ctx {
    fn new(spec: &QuerySpec, has_agg: bool, raw_remote: bool) -> Result<Self> {
        let mut group: Vec<(String, String)> = Vec::new();
        for g in &spec.group_by {
            let san = sanitize(g);
            if !group.iter().any(|(_, s)| *s == san) {
                group.push((g.clone(), san));
            }
        }

        let incr_order = spec
            .time_bucket
            .as_ref()
            .map(|tb| tb.column.clone())
            .or_else(|| spec.order_by.first().map(|o| o.column.clone()));

        let has_period = spec
            .projections
            .iter()
            .any(|p| p.kind == AggregateKind::Period)
            || spec
                .projections
                .iter()
                .any(|p| p.expr.to_lowercase().starts_with("period("));

        let mut anchor_query = None;
        let bucket = if has_period {
            let tb = spec.time_bucket.as_ref().ok_or_else(|| {
                Error::MalformedQuery("period requires a time-bucketing spec".to_string())
            })?;
            let anchor = match tb.anchor {
                Some(ts) => ts.timestamp().to_string(),
                None => {
                    let mut aq = format!("SELECT MAX({}) AS anchor FROM {}", tb.column, spec.table);
                    if let Some(f) = &spec.filter {
                        aq.push_str(&format!(" WHERE {}", f));
                    }
                    anchor_query = Some(aq);
                    ANCHOR_TOKEN.to_string()
                }
            };
            Some(BucketCtx { interval_secs: tb.interval_secs, anchor })
        } else {
            None
        };

        Ok(Self { has_agg, raw_remote, group, incr_order, bucket, anchor_query })
    }
}

/// Accumulated select items and consolidation columns.
#[derive(Default)]
struct Parts {
    remote: Vec<String>,
    local: Vec<String>,
    store: Vec<ColumnDesc>,
    /// `(delta expr, column name)` pairs feeding the increments subquery.
    deltas: Vec<(String, String)>,
    /// Bucket expression grouped on remotely, when a PERIOD projection exists.
    bucket_expr: Option<String>,
    /// Sanitized period column grouped on locally.
    period_col: Option<String>,
}

impl Parts {
    fn push_store(&mut self, name: &str, data_type: ColumnType) {
        if !self.store.iter().any(|c| c.name == name) {
            self.store.push(ColumnDesc::new(name, data_type));
        }
    }

    fn push_remote(&mut self, item: String) {
        if !self.remote.contains(&item) {
            self.remote.push(item);
        }
    }
}

/// One handler per aggregate kind; the match is exhaustive so a new kind
/// cannot compile without a decomposition rule.
fn decompose(c: &Classified, ctx: &Ctx, schema: Option<&[ColumnDesc]>, parts: &mut Parts) -> Result<()> {
    let e = c.inner.as_str();
    let col = if e == "*" { "rows".to_string() } else { sanitize(e) };
    let source_type = schema
        .and_then(|s| s.iter().find(|d| d.name.eq_ignore_ascii_case(e)))
        .map(|d| d.data_type);

    if ctx.raw_remote && c.kind != AggregateKind::None {
        return decompose_raw(c, &col, source_type, parts);
    }

    match c.kind {
        AggregateKind::None => {
            parts.push_remote(aliased(e, &col));
            parts.push_store(&col, source_type.unwrap_or(ColumnType::Text));
            parts.local.push(aliased(&col, &out_name(c, &col)));
        }
        AggregateKind::Count => {
            let name = format!("count_{}", col);
            let arg = if e == "*" { "*" } else { e };
            parts.push_remote(format!("COUNT({}) AS {}", arg, name));
            parts.push_store(&name, ColumnType::Int);
            parts.local.push(format!("SUM({}) AS {}", name, out_name(c, &name)));
        }
        AggregateKind::Sum => {
            let name = format!("sum_{}", col);
            parts.push_remote(format!("SUM({}) AS {}", e, name));
            parts.push_store(&name, ColumnType::Float);
            parts.local.push(format!("SUM({}) AS {}", name, out_name(c, &name)));
        }
        AggregateKind::Avg => {
            // Never average per-node averages: ship sum/count pairs and divide
            // once over the consolidated totals.
            let sum = format!("sum_{}", col);
            let count = format!("count_{}", col);
            parts.push_remote(format!("SUM({}) AS {}", e, sum));
            parts.push_remote(format!("COUNT({}) AS {}", e, count));
            parts.push_store(&sum, ColumnType::Float);
            parts.push_store(&count, ColumnType::Int);
            parts.local.push(format!(
                "SUM({}) / NULLIF(SUM({}), 0) AS {}",
                sum,
                count,
                out_name(c, &format!("avg_{}", col))
            ));
        }
        AggregateKind::Min => {
            let name = format!("min_{}", col);
            parts.push_remote(format!("MIN({}) AS {}", e, name));
            parts.push_store(&name, source_type.unwrap_or(ColumnType::Float));
            parts.local.push(format!("MIN({}) AS {}", name, out_name(c, &name)));
        }
        AggregateKind::Max => {
            let name = format!("max_{}", col);
            parts.push_remote(format!("MAX({}) AS {}", e, name));
            parts.push_store(&name, source_type.unwrap_or(ColumnType::Float));
            parts.local.push(format!("MAX({}) AS {}", name, out_name(c, &name)));
        }
        AggregateKind::Range => {
            let min = format!("min_{}", col);
            let max = format!("max_{}", col);
            parts.push_remote(format!("MIN({}) AS {}", e, min));
            parts.push_remote(format!("MAX({}) AS {}", e, max));
            parts.push_store(&min, ColumnType::Float);
            parts.push_store(&max, ColumnType::Float);
            parts.local.push(format!(
                "ABS(MAX({}) - MIN({})) AS {}",
                max,
                min,
                out_name(c, &format!("range_{}", col))
            ));
        }
        AggregateKind::CountDistinct => {
            unreachable!("count distinct always takes the raw-remote path");
        }
        AggregateKind::Increments => {
            let ord = ctx.incr_order.as_ref().ok_or_else(|| {
                Error::MalformedQuery(
                    "increments requires an ordering column (time bucket or ORDER BY)".to_string(),
                )
            })?;
            let delta_col = format!("delta_{}", col);
            let name = format!("incr_{}", col);
            // Counter resets produce negative deltas; they are summed as-is
            // rather than clamped.
            let partition = if ctx.group.is_empty() {
                String::new()
            } else {
                let cols: Vec<&str> = ctx.group.iter().map(|(g, _)| g.as_str()).collect();
                format!("PARTITION BY {} ", cols.join(", "))
            };
            let delta = format!("{} - LAG({}) OVER ({}ORDER BY {})", e, e, partition, ord);
            parts.deltas.push((delta, delta_col.clone()));
            parts.push_remote(format!("SUM({}) AS {}", delta_col, name));
            parts.push_store(&name, ColumnType::Float);
            parts.local.push(format!("SUM({}) AS {}", name, out_name(c, &name)));
        }
        AggregateKind::Period => {
            let bucket = ctx.bucket.as_ref().ok_or_else(|| {
                Error::MalformedQuery("period requires a time-bucketing spec".to_string())
            })?;
            let name = format!("period_{}", col);
            let expr = format!(
                "FLOOR((EXTRACT(EPOCH FROM {}) - {}) / {})",
                e, bucket.anchor, bucket.interval_secs
            );
            parts.push_remote(format!("{} AS {}", expr, name));
            parts.push_store(&name, ColumnType::Int);
            parts.local.push(format!(
                "({} * {}) + {} AS {}",
                name,
                bucket.interval_secs,
                bucket.anchor,
                out_name(c, &name)
            ));
            parts.bucket_expr = Some(expr);
            parts.period_col = Some(name);
        }
    }
    Ok(())
}

/// Raw-remote handlers: the remote query ships unaggregated values and the
/// local query applies the full aggregate over the union of all nodes' rows.
fn decompose_raw(
    c: &Classified,
    col: &str,
    source_type: Option<ColumnType>,
    parts: &mut Parts,
) -> Result<()> {
    let e = c.inner.as_str();
    let raw = if e == "*" { "raw_rows".to_string() } else { format!("raw_{}", col) };
    if e != "*" {
        parts.push_remote(aliased(e, &raw));
        parts.push_store(&raw, source_type.unwrap_or(ColumnType::Text));
    }
    let item = match c.kind {
        AggregateKind::CountDistinct => {
            format!("COUNT(DISTINCT {}) AS {}", raw, out_name(c, &format!("count_distinct_{}", col)))
        }
        AggregateKind::Count => {
            let arg = if e == "*" { "*".to_string() } else { raw.clone() };
            format!("COUNT({}) AS {}", arg, out_name(c, &format!("count_{}", col)))
        }
        AggregateKind::Sum => format!("SUM({}) AS {}", raw, out_name(c, &format!("sum_{}", col))),
        AggregateKind::Avg => format!("AVG({}) AS {}", raw, out_name(c, &format!("avg_{}", col))),
        AggregateKind::Min => format!("MIN({}) AS {}", raw, out_name(c, &format!("min_{}", col))),
        AggregateKind::Max => format!("MAX({}) AS {}", raw, out_name(c, &format!("max_{}", col))),
        AggregateKind::Range => format!(
            "ABS(MAX({}) - MIN({})) AS {}",
            raw,
            raw,
            out_name(c, &format!("range_{}", col))
        ),
        AggregateKind::None | AggregateKind::Increments | AggregateKind::Period => {
            return Err(Error::Internal(format!("{:?} in raw-remote path", c.kind)));
        }
    };
    parts.local.push(item);
    Ok(())
}

fn build_pass_through(spec: &QuerySpec, classified: &[Classified]) -> Result<String> {
    let items: Vec<String> = classified
        .iter()
        .map(|c| {
            let col = sanitize(&c.inner);
            match &c.alias {
                Some(a) => format!("{} AS {}", c.inner, a),
                None => aliased(&c.inner, &col),
            }
        })
        .collect();
    let mut sql = format!("SELECT {} FROM {}", items.join(", "), spec.table);
    if let Some(f) = &spec.filter {
        sql.push_str(&format!(" WHERE {}", f));
    }
    if let Some(n) = spec.limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    Ok(sql)
}

fn assemble_remote(spec: &QuerySpec, ctx: &Ctx, parts: &Parts) -> String {
    let from = if parts.deltas.is_empty() {
        let mut from = spec.table.clone();
        if let Some(f) = &spec.filter {
            from.push_str(&format!(" WHERE {}", f));
        }
        from
    } else {
        // Deltas are computed per row inside each node before aggregation, so
        // the filter moves into the subquery.
        let mut inner: Vec<String> = ctx.group.iter().map(|(g, s)| aliased(g, s)).collect();
        for (delta, name) in &parts.deltas {
            inner.push(format!("{} AS {}", delta, name));
        }
        let mut sub = format!("SELECT {} FROM {}", inner.join(", "), spec.table);
        if let Some(f) = &spec.filter {
            sub.push_str(&format!(" WHERE {}", f));
        }
        format!("({}) AS node_deltas", sub)
    };

    let mut sql = format!("SELECT {} FROM {}", parts.remote.join(", "), from);

    // Remote GROUP BY: raw-remote ships rows ungrouped; the deltas subquery
    // exposes sanitized names; otherwise group on the source expressions.
    if ctx.has_agg && !ctx.raw_remote {
        let mut keys: Vec<String> = if parts.deltas.is_empty() {
            ctx.group.iter().map(|(g, _)| g.clone()).collect()
        } else {
            ctx.group.iter().map(|(_, s)| s.clone()).collect()
        };
        if let Some(expr) = &parts.bucket_expr {
            keys.insert(0, expr.clone());
        }
        if !keys.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
        }
    } else if !ctx.has_agg && !ctx.group.is_empty() {
        let keys: Vec<String> = ctx.group.iter().map(|(g, _)| g.clone()).collect();
        sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
    }

    // Remote ordering is a per-node partial order only; emit it when the
    // ordering column survives into the remote output.
    let order: Vec<String> = spec
        .order_by
        .iter()
        .filter(|o| {
            ctx.group.iter().any(|(g, _)| g.eq_ignore_ascii_case(&o.column))
                || (!ctx.has_agg && parts.store.iter().any(|c| c.name == sanitize(&o.column)))
        })
        .map(|o| format!("{}{}", o.column, if o.descending { " DESC" } else { "" }))
        .collect();
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    } else if let Some(expr) = &parts.bucket_expr {
        sql.push_str(&format!(" ORDER BY {}", expr));
    }

    // A remote LIMIT under aggregation or grouping would truncate groups per
    // node and corrupt the merge; only plain row streams carry it down.
    if !ctx.has_agg && ctx.group.is_empty() {
        if let Some(n) = spec.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
    }
    sql
}

fn assemble_create(parts: &Parts) -> String {
    let cols: Vec<String> = parts
        .store
        .iter()
        .map(|c| format!("{} {}", c.name, c.data_type.sql_name()))
        .collect();
    format!("CREATE TABLE {} ({})", TABLE_TOKEN, cols.join(", "))
}

fn assemble_local(spec: &QuerySpec, ctx: &Ctx, parts: &Parts) -> String {
    let mut sql = format!("SELECT {} FROM {}", parts.local.join(", "), TABLE_TOKEN);

    let mut keys: Vec<String> = Vec::new();
    if let Some(p) = &parts.period_col {
        keys.push(p.clone());
    }
    if ctx.has_agg || !spec.group_by.is_empty() {
        keys.extend(ctx.group.iter().map(|(_, s)| s.clone()));
    }
    if !keys.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
    }

    // ORDER BY re-applies over the consolidated rows: per-node order never
    // implies global order. Columns that do not survive into the local
    // output (e.g. a time column under a pure aggregate) are dropped.
    let mut order: Vec<String> = spec
        .order_by
        .iter()
        .filter_map(|o| {
            local_order_name(spec, ctx, parts, &o.column)
                .map(|name| format!("{}{}", name, if o.descending { " DESC" } else { "" }))
        })
        .collect();
    if order.is_empty() {
        if let Some(p) = &parts.period_col {
            order.push(p.clone());
        }
    }
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    if let Some(n) = spec.limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    sql
}

/// Map an ORDER BY column onto the local query's namespace: a group column's
/// sanitized name, a projection alias, or the column's sanitized form when it
/// survives into the store.
fn local_order_name(spec: &QuerySpec, ctx: &Ctx, parts: &Parts, column: &str) -> Option<String> {
    if let Some((_, s)) = ctx.group.iter().find(|(g, _)| g.eq_ignore_ascii_case(column)) {
        return Some(s.clone());
    }
    for p in &spec.projections {
        if let Some(a) = &p.alias {
            if a.eq_ignore_ascii_case(column) {
                return Some(a.clone());
            }
        }
    }
    let san = sanitize(column);
    if parts.store.iter().any(|c| c.name == san) {
        return Some(san);
    }
    None
}

fn check_columns(spec: &QuerySpec, classified: &[Classified], schema: &[ColumnDesc]) -> Result<()> {
    let known = |name: &str| schema.iter().any(|c| c.name.eq_ignore_ascii_case(name));

    let mut referenced: Vec<String> = Vec::new();
    for c in classified {
        if c.inner != "*" {
            collect_columns(&parse_expr(&c.inner)?, &mut referenced);
        }
    }
    if let Some(f) = &spec.filter {
        collect_columns(&parse_predicate(f)?, &mut referenced);
    }
    referenced.extend(spec.group_by.iter().cloned());
    referenced.extend(spec.order_by.iter().map(|o| o.column.clone()));
    if let Some(tb) = &spec.time_bucket {
        referenced.push(tb.column.clone());
    }

    for name in referenced {
        // Ordering may legitimately target a projection alias.
        let is_alias = spec
            .projections
            .iter()
            .any(|p| p.alias.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(&name)));
        if !known(&name) && !is_alias {
            return Err(Error::UnknownColumn(name));
        }
    }
    Ok(())
}

fn validate_sql(sql: &str) -> Result<()> {
    Parser::parse_sql(&GenericDialect {}, sql)
        .map(|_| ())
        .map_err(|e| Error::MalformedQuery(format!("{}: in `{}`", e, sql)))
}

fn strip_tokens(sql: &str) -> String {
    sql.replace(TABLE_TOKEN, "floe_store").replace(ANCHOR_TOKEN, "0")
}

fn aliased(expr: &str, name: &str) -> String {
    if expr == name {
        expr.to_string()
    } else {
        format!("{} AS {}", expr, name)
    }
}

fn out_name(c: &Classified, default: &str) -> String {
    c.alias.clone().unwrap_or_else(|| default.to_string())
}

/// Combine into a safe column identifier: lowercase, non-alphanumerics folded
/// to single underscores.
fn sanitize(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut last_us = false;
    for ch in expr.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_us = false;
        } else if !last_us && !out.is_empty() {
            out.push('_');
            last_us = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_common::{GroupLimit, OrderBy, Projection, TimeBucket};

    fn spec_of(projections: Vec<Projection>) -> QuerySpec {
        QuerySpec::new("readings", projections)
    }

    #[test]
    fn count_becomes_local_sum() {
        let plan = transform(&spec_of(vec![Projection::column("count(value)")]), None).unwrap();
        assert_eq!(plan.remote_query, "SELECT COUNT(value) AS count_value FROM readings");
        assert_eq!(plan.local_query.as_deref(), Some("SELECT SUM(count_value) AS count_value FROM {table}"));
        assert!(!plan.pass_through);
    }

    #[test]
    fn avg_ships_sum_count_pair() {
        let plan = transform(&spec_of(vec![Projection::column("avg(value)")]), None).unwrap();
        assert_eq!(
            plan.remote_query,
            "SELECT SUM(value) AS sum_value, COUNT(value) AS count_value FROM readings"
        );
        let local = plan.local_query.unwrap();
        assert!(local.contains("SUM(sum_value) / NULLIF(SUM(count_value), 0)"), "{}", local);
        // Averaging per-node averages is mathematically wrong; AVG must not
        // survive into either artifact.
        assert!(!plan.remote_query.to_uppercase().contains("AVG("));
        assert!(!local.to_uppercase().contains("AVG("));
    }

    #[test]
    fn count_distinct_ships_raw_values() {
        let plan = transform(&spec_of(vec![Projection::column("count(distinct device)")]), None).unwrap();
        assert_eq!(plan.remote_query, "SELECT device AS raw_device FROM readings");
        assert_eq!(
            plan.local_query.as_deref(),
            Some("SELECT COUNT(DISTINCT raw_device) AS count_distinct_device FROM {table}")
        );
    }

    #[test]
    fn range_is_min_max_pair() {
        let plan = transform(&spec_of(vec![Projection::column("range(value)")]), None).unwrap();
        assert_eq!(
            plan.remote_query,
            "SELECT MIN(value) AS min_value, MAX(value) AS max_value FROM readings"
        );
        assert!(plan
            .local_query
            .unwrap()
            .contains("ABS(MAX(max_value) - MIN(min_value))"));
    }

    #[test]
    fn min_max_are_distributive() {
        let plan = transform(
            &spec_of(vec![Projection::column("min(value)"), Projection::column("max(value)")]),
            None,
        )
        .unwrap();
        assert_eq!(
            plan.remote_query,
            "SELECT MIN(value) AS min_value, MAX(value) AS max_value FROM readings"
        );
        assert_eq!(
            plan.local_query.as_deref(),
            Some("SELECT MIN(min_value) AS min_value, MAX(max_value) AS max_value FROM {table}")
        );
    }

    #[test]
    fn grouping_columns_propagate_to_both_stages() {
        let mut spec = spec_of(vec![Projection::column("sum(value)")]);
        spec.group_by = vec!["city".to_string()];
        let plan = transform(&spec, None).unwrap();
        assert_eq!(
            plan.remote_query,
            "SELECT city, SUM(value) AS sum_value FROM readings GROUP BY city"
        );
        assert_eq!(
            plan.local_query.as_deref(),
            Some("SELECT city, SUM(sum_value) AS sum_value FROM {table} GROUP BY city")
        );
        assert_eq!(
            plan.local_create.as_deref(),
            Some("CREATE TABLE {table} (city TEXT, sum_value DOUBLE PRECISION)")
        );
    }

    #[test]
    fn grouping_columns_keep_declaration_order() {
        let mut spec = spec_of(vec![Projection::column("sum(value)")]);
        spec.group_by = vec!["city".to_string(), "device".to_string()];
        let plan = transform(&spec, None).unwrap();
        assert_eq!(
            plan.remote_query,
            "SELECT city, device, SUM(value) AS sum_value FROM readings GROUP BY city, device"
        );
        assert_eq!(
            plan.local_query.as_deref(),
            Some("SELECT city, device, SUM(sum_value) AS sum_value FROM {table} GROUP BY city, device")
        );
    }

    #[test]
    fn order_by_reapplied_locally() {
        let mut spec = spec_of(vec![Projection::column("sum(value)")]);
        spec.group_by = vec!["city".to_string()];
        spec.order_by = vec![OrderBy::desc("city")];
        spec.limit = Some(10);
        let plan = transform(&spec, None).unwrap();
        assert!(plan.remote_query.ends_with("GROUP BY city ORDER BY city DESC"));
        let local = plan.local_query.unwrap();
        assert!(local.ends_with("ORDER BY city DESC LIMIT 10"), "{}", local);
    }

    #[test]
    fn pass_through_classification() {
        let plan = transform(&spec_of(vec![Projection::column("value")]), None).unwrap();
        assert!(plan.pass_through);
        assert!(plan.local_create.is_none());
        assert!(plan.local_query.is_none());
        assert!(plan.anchor_query.is_none());
    }

    #[test]
    fn any_consolidation_trigger_flips_pass_through() {
        let base = spec_of(vec![Projection::column("value")]);
        assert!(transform(&base, None).unwrap().pass_through);

        let mut with_group = base.clone();
        with_group.group_by = vec!["city".to_string()];
        assert!(!transform(&with_group, None).unwrap().pass_through);

        let mut with_order = base.clone();
        with_order.order_by = vec![OrderBy::asc("value")];
        assert!(!transform(&with_order, None).unwrap().pass_through);

        let mut with_limit = base.clone();
        with_limit.per_group_limit =
            Some(GroupLimit { columns: vec!["value".to_string()], limit: 1 });
        assert!(!transform(&with_limit, None).unwrap().pass_through);

        let mut with_agg = base;
        with_agg.projections = vec![Projection::column("sum(value)")];
        assert!(!transform(&with_agg, None).unwrap().pass_through);
    }

    #[test]
    fn pass_through_keeps_filter_and_limit() {
        let mut spec = spec_of(vec![Projection::column("value")]);
        spec.filter = Some("value > 3".to_string());
        spec.limit = Some(5);
        let plan = transform(&spec, None).unwrap();
        assert_eq!(plan.remote_query, "SELECT value FROM readings WHERE value > 3 LIMIT 5");
    }

    #[test]
    fn unknown_column_rejected_with_schema() {
        let schema = vec![ColumnDesc::new("value", ColumnType::Float)];
        let err = transform(&spec_of(vec![Projection::column("sum(missing)")]), Some(&schema))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownColumn(name) if name == "missing"));
    }

    #[test]
    fn malformed_filter_rejected() {
        let mut spec = spec_of(vec![Projection::column("value")]);
        spec.filter = Some("value >".to_string());
        assert!(matches!(transform(&spec, None), Err(Error::MalformedQuery(_))));
    }

    #[test]
    fn increments_uses_ordered_deltas() {
        let mut spec = spec_of(vec![Projection::column("increments(counter)")]);
        spec.order_by = vec![OrderBy::asc("ts")];
        let plan = transform(&spec, None).unwrap();
        assert!(plan.remote_query.contains("LAG(counter) OVER (ORDER BY ts)"), "{}", plan.remote_query);
        assert!(plan.remote_query.contains("SUM(delta_counter) AS incr_counter"));
        assert!(plan.local_query.unwrap().contains("SUM(incr_counter)"));
    }

    #[test]
    fn increments_without_order_column_rejected() {
        let spec = spec_of(vec![Projection::column("increments(counter)")]);
        assert!(matches!(transform(&spec, None), Err(Error::MalformedQuery(_))));
    }

    #[test]
    fn increments_rejects_other_aggregates() {
        let mut spec = spec_of(vec![
            Projection::column("increments(counter)"),
            Projection::column("avg(value)"),
        ]);
        spec.order_by = vec![OrderBy::asc("ts")];
        assert!(matches!(transform(&spec, None), Err(Error::UnsupportedFunction(_))));
    }

    #[test]
    fn period_without_anchor_emits_lookup() {
        let mut spec = spec_of(vec![
            Projection::column("period(ts)"),
            Projection::column("avg(value)"),
        ]);
        spec.time_bucket =
            Some(TimeBucket { column: "ts".to_string(), interval_secs: 60, anchor: None });
        let plan = transform(&spec, None).unwrap();
        assert_eq!(plan.anchor_query.as_deref(), Some("SELECT MAX(ts) AS anchor FROM readings"));
        assert!(plan.remote_query.contains(ANCHOR_TOKEN));
        assert!(plan.remote_query.contains("FLOOR((EXTRACT(EPOCH FROM ts) - {anchor}) / 60)"));
        assert!(plan.remote_query.contains("GROUP BY FLOOR"));
        assert!(plan.local_query.unwrap().contains("GROUP BY period_ts"));
    }

    #[test]
    fn period_with_anchor_inlines_epoch() {
        use chrono::TimeZone;
        let mut spec = spec_of(vec![Projection::column("period(ts)"), Projection::column("sum(value)")]);
        spec.time_bucket = Some(TimeBucket {
            column: "ts".to_string(),
            interval_secs: 3600,
            anchor: Some(chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
        });
        let plan = transform(&spec, None).unwrap();
        assert!(plan.anchor_query.is_none());
        assert!(plan.remote_query.contains("1700000000"));
    }

    #[test]
    fn mixed_aggregates_with_count_distinct_go_raw() {
        let plan = transform(
            &spec_of(vec![
                Projection::column("count(distinct device)"),
                Projection::column("sum(value)"),
            ]),
            None,
        )
        .unwrap();
        assert_eq!(
            plan.remote_query,
            "SELECT device AS raw_device, value AS raw_value FROM readings"
        );
        let local = plan.local_query.unwrap();
        assert!(local.contains("COUNT(DISTINCT raw_device)"));
        assert!(local.contains("SUM(raw_value)"));
    }

    #[test]
    fn store_ddl_types_are_numeric_for_counts_and_sums() {
        let plan = transform(&spec_of(vec![Projection::column("avg(value)")]), None).unwrap();
        assert_eq!(
            plan.local_create.as_deref(),
            Some("CREATE TABLE {table} (sum_value DOUBLE PRECISION, count_value BIGINT)")
        );
    }

    #[test]
    fn alias_survives_to_local_output() {
        let plan = transform(
            &spec_of(vec![Projection::column("avg(value)").with_alias("mean_v")]),
            None,
        )
        .unwrap();
        assert!(plan.local_query.unwrap().contains("AS mean_v"));
    }

    #[test]
    fn count_star_decomposes() {
        let plan = transform(&spec_of(vec![Projection::column("count(*)")]), None).unwrap();
        assert_eq!(plan.remote_query, "SELECT COUNT(*) AS count_rows FROM readings");
        assert_eq!(plan.local_query.as_deref(), Some("SELECT SUM(count_rows) AS count_rows FROM {table}"));
    }
}
