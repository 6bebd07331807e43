//! Builds parameterized SELECT, INSERT, UPDATE, DELETE from an entity descriptor and a
//! compiled condition. Identifiers come from descriptors or pass through `sanitize_field`;
//! values always travel as parameters.

use crate::config::{AssociationDirection, EntityDescriptor, ResolvedModel};
use crate::error::RuntimeError;
use crate::query::{sanitize_field, DeletedScope, SortKey};
use crate::relational::dialect::{Condition, RelInclude, SqlOp};
use serde_json::{Map, Value};

pub const MAIN_ALIAS: &str = "main";

/// Fields every record carries regardless of declared columns.
pub const RECORD_FIELDS: &[&str] = &[
    "active",
    "created_at",
    "created_by",
    "updated_at",
    "updated_by",
    "deleted",
    "deleted_at",
    "deleted_by",
];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    pub fn new() -> Self {
        QueryBuf::default()
    }

    fn push_param(&mut self, v: Value) -> u32 {
        self.params.push(v);
        self.params.len() as u32
    }
}

/// Quote identifier for PostgreSQL.
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn qualified_table(entity: &EntityDescriptor) -> String {
    match &entity.schema_name {
        Some(schema) => format!("{}.{}", quoted(schema), quoted(&entity.table_name)),
        None => quoted(&entity.table_name),
    }
}

/// Plain columns are qualified with the alias; a dotted path addresses a key inside a
/// JSON column (`meta.color` is `main."meta" #> '{color}'`).
fn column_expr(alias: &str, column: &str) -> String {
    let column = sanitize_field(column);
    match column.split_once('.') {
        Some((head, rest)) => json_path(alias, head, rest, "#>"),
        None => format!("{}.{}", alias, quoted(&column)),
    }
}

fn json_path(alias: &str, head: &str, rest: &str, op: &str) -> String {
    format!("{}.{} {} '{{{}}}'", alias, quoted(head), op, rest.replace('.', ","))
}

fn placeholder(entity: &EntityDescriptor, column: &str, n: u32) -> String {
    entity
        .column(column)
        .and_then(|c| c.pg_type.as_deref())
        .map(|t| format!("${}::{}", n, t))
        .unwrap_or_else(|| format!("${}", n))
}

fn writable(entity: &EntityDescriptor, pk: &str, column: &str) -> bool {
    entity.columns.is_empty()
        || column == pk
        || RECORD_FIELDS.contains(&column)
        || entity.column(column).is_some()
}

/// SELECT list: declared columns (enum and numeric cast to text so they decode as strings),
/// the projected subset when attributes are given, or `alias.*`.
fn select_column_list(entity: &EntityDescriptor, alias: &str, attributes: Option<&[String]>) -> String {
    let render = |name: &str| {
        let q = quoted(name);
        let pg_type = entity.column(name).and_then(|c| c.pg_type.as_deref()).unwrap_or("");
        if pg_type.contains('.') || pg_type == "numeric" {
            format!("{}.{}::text AS {}", alias, q, q)
        } else {
            format!("{}.{}", alias, q)
        }
    };
    match attributes {
        Some(attrs) if !attrs.is_empty() => attrs
            .iter()
            .map(|a| sanitize_field(a))
            .filter(|a| !a.is_empty() && !a.contains('.'))
            .map(|a| render(&a))
            .collect::<Vec<_>>()
            .join(", "),
        _ if !entity.columns.is_empty() => entity
            .columns
            .iter()
            .map(|c| render(&c.name))
            .collect::<Vec<_>>()
            .join(", "),
        _ => format!("{}.*", alias),
    }
}

fn scope_sql(scope: DeletedScope, alias: &str) -> Option<String> {
    match scope {
        DeletedScope::Live => Some(format!("{}.{} = FALSE", alias, quoted("deleted"))),
        DeletedScope::OnlyDeleted => Some(format!("{}.{} = TRUE", alias, quoted("deleted"))),
        DeletedScope::All => None,
    }
}

fn value_placeholder(q: &mut QueryBuf, entity: &EntityDescriptor, column: &str, v: &Value) -> String {
    let n = q.push_param(v.clone());
    placeholder(entity, column, n)
}

fn compare_symbol(op: SqlOp) -> &'static str {
    match op {
        SqlOp::Eq => "=",
        SqlOp::Ne => "<>",
        SqlOp::Gt => ">",
        SqlOp::Gte => ">=",
        SqlOp::Lt => "<",
        SqlOp::Lte => "<=",
        SqlOp::In => "IN",
        SqlOp::NotIn => "NOT IN",
        SqlOp::Is => "IS",
        SqlOp::Like => "LIKE",
        SqlOp::NotLike => "NOT LIKE",
        SqlOp::ILike => "ILIKE",
        SqlOp::NotILike => "NOT ILIKE",
    }
}

fn in_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn render_compare(
    q: &mut QueryBuf,
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    alias: &str,
    column: &str,
    op: SqlOp,
    value: &Value,
) -> String {
    let column = sanitize_field(column);
    if let Some((head, rest)) = column.split_once('.') {
        let target = entity
            .association(head)
            .and_then(|a| model.entity(&a.target).map(|t| (a, t)));
        return match target {
            Some((assoc, target)) => {
                // `assoc.field`: some related row satisfies the comparison.
                let sub = format!("{}_v", alias);
                let inner = render_compare(q, model, target, &sub, rest, op, value);
                format!(
                    "EXISTS (SELECT 1 FROM {} AS {} WHERE {}.{} = {}.{} AND {})",
                    qualified_table(target),
                    sub,
                    sub,
                    quoted(&assoc.foreign_key),
                    alias,
                    quoted(&assoc.local_key),
                    inner
                )
            }
            None => render_json_compare(q, alias, head, rest, op, value),
        };
    }

    let col = format!("{}.{}", alias, quoted(&column));
    match op {
        SqlOp::Eq | SqlOp::Is if value.is_null() => format!("{} IS NULL", col),
        SqlOp::Ne if value.is_null() => format!("{} IS NOT NULL", col),
        SqlOp::Is => match value {
            Value::Bool(true) => format!("{} IS TRUE", col),
            Value::Bool(false) => format!("{} IS FALSE", col),
            other => format!("{} IS NOT DISTINCT FROM {}", col, value_placeholder(q, entity, &column, other)),
        },
        SqlOp::In | SqlOp::NotIn => {
            let items = in_items(value);
            if items.is_empty() {
                return if op == SqlOp::In { "FALSE".into() } else { "TRUE".into() };
            }
            let phs: Vec<String> = items.iter().map(|v| value_placeholder(q, entity, &column, v)).collect();
            format!("{} {} ({})", col, compare_symbol(op), phs.join(", "))
        }
        SqlOp::Like | SqlOp::NotLike | SqlOp::ILike | SqlOp::NotILike => {
            let n = q.push_param(value.clone());
            format!("{}::text {} ${}", col, compare_symbol(op), n)
        }
        SqlOp::Eq | SqlOp::Ne | SqlOp::Gt | SqlOp::Gte | SqlOp::Lt | SqlOp::Lte => {
            format!("{} {} {}", col, compare_symbol(op), value_placeholder(q, entity, &column, value))
        }
    }
}

/// Comparison on a key inside a JSON column. Values are lifted with `to_jsonb` so numbers
/// and strings compare by their JSON ordering.
fn render_json_compare(q: &mut QueryBuf, alias: &str, head: &str, rest: &str, op: SqlOp, value: &Value) -> String {
    let json = json_path(alias, head, rest, "#>");
    match op {
        SqlOp::Eq | SqlOp::Is if value.is_null() => format!("{} IS NULL", json),
        SqlOp::Ne if value.is_null() => format!("{} IS NOT NULL", json),
        SqlOp::Is => format!("{} IS NOT DISTINCT FROM to_jsonb(${})", json, q.push_param(value.clone())),
        SqlOp::In | SqlOp::NotIn => {
            let items = in_items(value);
            if items.is_empty() {
                return if op == SqlOp::In { "FALSE".into() } else { "TRUE".into() };
            }
            let phs: Vec<String> = items
                .into_iter()
                .map(|v| format!("to_jsonb(${})", q.push_param(v)))
                .collect();
            format!("{} {} ({})", json, compare_symbol(op), phs.join(", "))
        }
        SqlOp::Like | SqlOp::NotLike | SqlOp::ILike | SqlOp::NotILike => {
            let n = q.push_param(value.clone());
            format!("({}) {} ${}", json_path(alias, head, rest, "#>>"), compare_symbol(op), n)
        }
        _ => format!("{} {} to_jsonb(${})", json, compare_symbol(op), q.push_param(value.clone())),
    }
}

pub fn render_condition(
    q: &mut QueryBuf,
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    alias: &str,
    cond: &Condition,
) -> String {
    match cond {
        Condition::And(parts) if parts.is_empty() => "TRUE".into(),
        Condition::Or(parts) if parts.is_empty() => "FALSE".into(),
        Condition::And(parts) => {
            let rendered: Vec<String> = parts.iter().map(|p| render_condition(q, model, entity, alias, p)).collect();
            format!("({})", rendered.join(" AND "))
        }
        Condition::Or(parts) => {
            let rendered: Vec<String> = parts.iter().map(|p| render_condition(q, model, entity, alias, p)).collect();
            format!("({})", rendered.join(" OR "))
        }
        Condition::Not(inner) => format!("NOT ({})", render_condition(q, model, entity, alias, inner)),
        Condition::Compare { column, op, value } => render_compare(q, model, entity, alias, column, *op, value),
    }
}

fn resolve_association<'m>(
    model: &'m ResolvedModel,
    parent: &EntityDescriptor,
    name: &str,
) -> Result<(&'m crate::config::Association, &'m EntityDescriptor), RuntimeError> {
    let unknown = || RuntimeError::Validation(format!("unknown association '{}' on {}", name, parent.name));
    let assoc = model
        .entity(&parent.name)
        .and_then(|p| p.association(name))
        .ok_or_else(unknown)?;
    let target = model.entity(&assoc.target).ok_or_else(unknown)?;
    Ok((assoc, target))
}

fn exists_clause(
    model: &ResolvedModel,
    parent: &EntityDescriptor,
    parent_alias: &str,
    inc: &RelInclude,
    idx: usize,
) -> Result<String, RuntimeError> {
    let (assoc, target) = resolve_association(model, parent, &inc.association)?;
    let alias = format!("{}_r{}", parent_alias, idx);
    let mut conds = vec![format!(
        "{}.{} = {}.{}",
        alias,
        quoted(&assoc.foreign_key),
        parent_alias,
        quoted(&assoc.local_key)
    )];
    if inc.paranoid {
        conds.extend(scope_sql(DeletedScope::Live, &alias));
    }
    Ok(format!(
        "EXISTS (SELECT 1 FROM {} AS {} WHERE {})",
        qualified_table(target),
        alias,
        conds.join(" AND ")
    ))
}

/// Correlated subqueries for joined includes: `row_to_json` for to-one, `json_agg` for to-many.
fn include_exprs(
    model: &ResolvedModel,
    parent: &EntityDescriptor,
    parent_alias: &str,
    includes: &[RelInclude],
    skip_separate: bool,
) -> Result<Vec<String>, RuntimeError> {
    let mut out = Vec::new();
    for (i, inc) in includes.iter().enumerate() {
        if skip_separate && inc.separate {
            continue;
        }
        let (assoc, target) = resolve_association(model, parent, &inc.association)?;
        let alias = format!("{}_{}", parent_alias, i);
        let mut cols = vec![select_column_list(target, &alias, inc.attributes.as_deref())];
        cols.extend(include_exprs(model, target, &alias, &inc.include, false)?);
        let mut conds = vec![format!(
            "{}.{} = {}.{}",
            alias,
            quoted(&assoc.foreign_key),
            parent_alias,
            quoted(&assoc.local_key)
        )];
        if inc.paranoid {
            conds.extend(scope_sql(DeletedScope::Live, &alias));
        }
        for (j, child) in inc.include.iter().enumerate().filter(|(_, c)| c.required) {
            conds.push(exists_clause(model, target, &alias, child, j)?);
        }
        let body = format!(
            "SELECT {} FROM {} AS {} WHERE {}",
            cols.join(", "),
            qualified_table(target),
            alias,
            conds.join(" AND ")
        );
        let expr = match assoc.direction {
            AssociationDirection::ToOne => format!("(SELECT row_to_json(sub) FROM ({} LIMIT 1) sub)", body),
            AssociationDirection::ToMany => format!(
                "(SELECT COALESCE(json_agg(row_to_json(sub)), '[]'::json) FROM ({}) sub)",
                body
            ),
        };
        out.push(format!("{} AS {}", expr, quoted(&inc.association)));
    }
    Ok(out)
}

fn where_clause(
    q: &mut QueryBuf,
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    scope: DeletedScope,
    filter: Option<&Condition>,
    includes: &[RelInclude],
) -> Result<String, RuntimeError> {
    let mut parts: Vec<String> = scope_sql(scope, MAIN_ALIAS).into_iter().collect();
    if let Some(cond) = filter.filter(|c| !c.is_empty()) {
        parts.push(render_condition(q, model, entity, MAIN_ALIAS, cond));
    }
    for (i, inc) in includes.iter().enumerate().filter(|(_, inc)| inc.required) {
        parts.push(exists_clause(model, entity, MAIN_ALIAS, inc, i)?);
    }
    Ok(if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    })
}

/// Inputs for a primary SELECT.
pub struct SelectSpec<'a> {
    pub entity: &'a EntityDescriptor,
    pub scope: DeletedScope,
    pub filter: Option<&'a Condition>,
    pub attributes: Option<&'a [String]>,
    pub sort: &'a [SortKey],
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub includes: &'a [RelInclude],
}

pub fn select(model: &ResolvedModel, spec: &SelectSpec<'_>) -> Result<QueryBuf, RuntimeError> {
    let mut q = QueryBuf::new();
    let mut cols = vec![select_column_list(spec.entity, MAIN_ALIAS, spec.attributes)];
    cols.extend(include_exprs(model, spec.entity, MAIN_ALIAS, spec.includes, true)?);
    let where_sql = where_clause(&mut q, model, spec.entity, spec.scope, spec.filter, spec.includes)?;
    let mut sql = format!(
        "SELECT {} FROM {} AS {}{}",
        cols.join(", "),
        qualified_table(spec.entity),
        MAIN_ALIAS,
        where_sql
    );
    if !spec.sort.is_empty() {
        let order: Vec<String> = spec
            .sort
            .iter()
            .map(|k| format!("{} {}", column_expr(MAIN_ALIAS, &k.field), k.direction.as_sql()))
            .collect();
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    if let Some(limit) = spec.limit {
        let n = q.push_param(Value::from(limit));
        sql.push_str(&format!(" LIMIT ${}", n));
    }
    if let Some(offset) = spec.offset.filter(|o| *o > 0) {
        let n = q.push_param(Value::from(offset));
        sql.push_str(&format!(" OFFSET ${}", n));
    }
    q.sql = sql;
    Ok(q)
}

pub fn count(
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    scope: DeletedScope,
    filter: Option<&Condition>,
    includes: &[RelInclude],
) -> Result<QueryBuf, RuntimeError> {
    let mut q = QueryBuf::new();
    let where_sql = where_clause(&mut q, model, entity, scope, filter, includes)?;
    q.sql = format!(
        "SELECT COUNT(*) AS {} FROM {} AS {}{}",
        quoted("count"),
        qualified_table(entity),
        MAIN_ALIAS,
        where_sql
    );
    Ok(q)
}

/// Batched fetch of related rows for a separately-fetched include.
pub fn select_by_column_in(
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    column: &str,
    values: &[Value],
    inc: &RelInclude,
) -> Result<QueryBuf, RuntimeError> {
    let mut q = QueryBuf::new();
    let mut cols = vec![select_column_list(entity, MAIN_ALIAS, inc.attributes.as_deref())];
    if inc.attributes.as_ref().is_some_and(|a| !a.iter().any(|c| c == column)) {
        cols.push(format!("{}.{}", MAIN_ALIAS, quoted(column)));
    }
    cols.extend(include_exprs(model, entity, MAIN_ALIAS, &inc.include, false)?);
    let mut parts = vec![render_compare(
        &mut q,
        model,
        entity,
        MAIN_ALIAS,
        column,
        SqlOp::In,
        &Value::Array(values.to_vec()),
    )];
    if inc.paranoid {
        parts.extend(scope_sql(DeletedScope::Live, MAIN_ALIAS));
    }
    for (j, child) in inc.include.iter().enumerate().filter(|(_, c)| c.required) {
        parts.push(exists_clause(model, entity, MAIN_ALIAS, child, j)?);
    }
    q.sql = format!(
        "SELECT {} FROM {} AS {} WHERE {}",
        cols.join(", "),
        qualified_table(entity),
        MAIN_ALIAS,
        parts.join(" AND ")
    );
    Ok(q)
}

/// Multi-row INSERT; rows missing a column get DEFAULT. `created_at`/`updated_at` are NOW()
/// unless supplied.
pub fn insert(entity: &EntityDescriptor, pk: &str, rows: &[Map<String, Value>]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            let col = sanitize_field(key);
            if !col.is_empty() && !col.contains('.') && writable(entity, pk, &col) && !columns.contains(&col) {
                columns.push(col);
            }
        }
    }
    let stamps: Vec<&str> = ["created_at", "updated_at"]
        .into_iter()
        .filter(|s| !columns.iter().any(|c| c == s))
        .collect();
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values: Vec<String> = columns
            .iter()
            .map(|col| match row.get(col) {
                Some(v) => value_placeholder(&mut q, entity, col, v),
                None => "DEFAULT".into(),
            })
            .collect();
        values.extend(stamps.iter().map(|_| "NOW()".to_string()));
        tuples.push(format!("({})", values.join(", ")));
    }
    let all_cols: Vec<String> = columns
        .iter()
        .map(|c| quoted(c))
        .chain(stamps.iter().map(|s| quoted(s)))
        .collect();
    q.sql = format!(
        "INSERT INTO {} AS {} ({}) VALUES {} RETURNING {}",
        qualified_table(entity),
        MAIN_ALIAS,
        all_cols.join(", "),
        tuples.join(", "),
        select_column_list(entity, MAIN_ALIAS, None)
    );
    q
}

fn update_with_sets(
    mut q: QueryBuf,
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    sets: Vec<String>,
    scope: DeletedScope,
    filter: &Condition,
) -> QueryBuf {
    let mut parts: Vec<String> = scope_sql(scope, MAIN_ALIAS).into_iter().collect();
    if !filter.is_empty() {
        parts.push(render_condition(&mut q, model, entity, MAIN_ALIAS, filter));
    }
    let where_sql = if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    };
    q.sql = format!(
        "UPDATE {} AS {} SET {}{} RETURNING {}",
        qualified_table(entity),
        MAIN_ALIAS,
        sets.join(", "),
        where_sql,
        select_column_list(entity, MAIN_ALIAS, None)
    );
    q
}

/// UPDATE matching rows: SET only writable columns present in `changes`, plus `updated_at`.
pub fn update(
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    pk: &str,
    scope: DeletedScope,
    filter: &Condition,
    changes: &Map<String, Value>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut sets = Vec::new();
    for (k, v) in changes {
        let col = sanitize_field(k);
        if col.is_empty() || col.contains('.') || col == pk || col == "updated_at" || !writable(entity, pk, &col) {
            continue;
        }
        let ph = value_placeholder(&mut q, entity, &col, v);
        sets.push(format!("{} = {}", quoted(&col), ph));
    }
    sets.push(format!("{} = NOW()", quoted("updated_at")));
    update_with_sets(q, model, entity, sets, scope, filter)
}

/// Soft delete (`deleted = true`) or restore (`deleted = false`) of matching rows.
pub fn set_deleted(
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    scope: DeletedScope,
    filter: &Condition,
    deleted: bool,
    actor: Option<&Value>,
) -> QueryBuf {
    let mut q = QueryBuf::new();
    let actor_ph = |q: &mut QueryBuf| match actor {
        Some(a) => format!("${}", q.push_param(a.clone())),
        None => "NULL".to_string(),
    };
    let mut sets = Vec::new();
    if deleted {
        sets.push(format!("{} = TRUE", quoted("deleted")));
        sets.push(format!("{} = NOW()", quoted("deleted_at")));
        let ph = actor_ph(&mut q);
        sets.push(format!("{} = {}", quoted("deleted_by"), ph));
    } else {
        sets.push(format!("{} = FALSE", quoted("deleted")));
        sets.push(format!("{} = NULL", quoted("deleted_at")));
        sets.push(format!("{} = NULL", quoted("deleted_by")));
        if actor.is_some() {
            let ph = actor_ph(&mut q);
            sets.push(format!("{} = {}", quoted("updated_by"), ph));
        }
    }
    sets.push(format!("{} = NOW()", quoted("updated_at")));
    update_with_sets(q, model, entity, sets, scope, filter)
}

/// Physical DELETE of matching rows.
pub fn delete(model: &ResolvedModel, entity: &EntityDescriptor, scope: DeletedScope, filter: &Condition) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut parts: Vec<String> = scope_sql(scope, MAIN_ALIAS).into_iter().collect();
    if !filter.is_empty() {
        parts.push(render_condition(&mut q, model, entity, MAIN_ALIAS, filter));
    }
    let where_sql = if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    };
    q.sql = format!(
        "DELETE FROM {} AS {}{} RETURNING {}",
        qualified_table(entity),
        MAIN_ALIAS,
        where_sql,
        select_column_list(entity, MAIN_ALIAS, None)
    );
    q
}

/// Grouped aggregate: `{ "groupBy": ["status"], "metrics": [{ "fn": "sum", "field": "total", "as": "revenue" }] }`.
/// A metric without `field` is only valid for `count`.
pub fn aggregate(
    model: &ResolvedModel,
    entity: &EntityDescriptor,
    scope: DeletedScope,
    filter: Option<&Condition>,
    spec: &Value,
) -> Result<QueryBuf, RuntimeError> {
    let invalid = |msg: &str| RuntimeError::Validation(format!("invalid aggregate: {}", msg));
    let spec = spec.as_object().ok_or_else(|| invalid("expected an object"))?;
    let group_by: Vec<String> = spec
        .get("groupBy")
        .and_then(Value::as_array)
        .map(|cols| cols.iter().filter_map(Value::as_str).map(sanitize_field).filter(|c| !c.is_empty()).collect())
        .unwrap_or_default();
    let metrics = spec
        .get("metrics")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| invalid("metrics must be a non-empty array"))?;

    let mut cols: Vec<String> = group_by.iter().map(|c| column_expr(MAIN_ALIAS, c)).collect();
    for metric in metrics {
        let func = metric.get("fn").and_then(Value::as_str).unwrap_or("count").to_ascii_lowercase();
        let field = metric.get("field").and_then(Value::as_str).map(sanitize_field).filter(|f| !f.is_empty());
        let sql_fn = match func.as_str() {
            "count" => "COUNT",
            "sum" => "SUM",
            "avg" => "AVG",
            "min" => "MIN",
            "max" => "MAX",
            other => return Err(invalid(&format!("unsupported fn '{}'", other))),
        };
        let arg = match (&field, sql_fn) {
            (Some(f), _) => column_expr(MAIN_ALIAS, f),
            (None, "COUNT") => "*".to_string(),
            (None, _) => return Err(invalid(&format!("{} needs a field", func))),
        };
        let name = metric
            .get("as")
            .and_then(Value::as_str)
            .map(sanitize_field)
            .filter(|n| !n.is_empty() && !n.contains('.'))
            .unwrap_or_else(|| match &field {
                Some(f) => format!("{}_{}", func, f.replace('.', "_")),
                None => func.clone(),
            });
        // numeric results are returned as text by the driver; cast to float8 so they decode as numbers
        let expr = if sql_fn == "COUNT" {
            format!("{}({})", sql_fn, arg)
        } else {
            format!("{}({})::float8", sql_fn, arg)
        };
        cols.push(format!("{} AS {}", expr, quoted(&name)));
    }

    let mut q = QueryBuf::new();
    let mut parts: Vec<String> = scope_sql(scope, MAIN_ALIAS).into_iter().collect();
    if let Some(cond) = filter.filter(|c| !c.is_empty()) {
        parts.push(render_condition(&mut q, model, entity, MAIN_ALIAS, cond));
    }
    let mut sql = format!("SELECT {} FROM {} AS {}", cols.join(", "), qualified_table(entity), MAIN_ALIAS);
    if !parts.is_empty() {
        sql.push_str(&format!(" WHERE {}", parts.join(" AND ")));
    }
    if !group_by.is_empty() {
        let groups: Vec<String> = group_by.iter().map(|c| column_expr(MAIN_ALIAS, c)).collect();
        sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
    }
    q.sql = sql;
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Association;
    use crate::query::SortDirection;
    use serde_json::json;

    fn model() -> ResolvedModel {
        ResolvedModel::from_entities(vec![
            EntityDescriptor::new("users")
                .with_association(Association::to_many("orders", "orders", "id", "user_id")),
            EntityDescriptor::new("orders")
                .with_schema("shop")
                .with_column("id", Some("uuid"))
                .with_column("user_id", None)
                .with_column("total", Some("numeric"))
                .with_association(Association::to_one("user", "users", "user_id", "id")),
        ])
    }

    #[test]
    fn select_applies_scope_filter_sort_and_window() {
        let m = model();
        let users = m.entity("users").unwrap();
        let cond = Condition::compare("age", SqlOp::Gte, json!(18));
        let sort = vec![SortKey {
            field: "name".into(),
            direction: SortDirection::Desc,
        }];
        let q = select(
            &m,
            &SelectSpec {
                entity: users,
                scope: DeletedScope::Live,
                filter: Some(&cond),
                attributes: None,
                sort: &sort,
                offset: Some(40),
                limit: Some(20),
                includes: &[],
            },
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT main.* FROM \"users\" AS main WHERE main.\"deleted\" = FALSE AND main.\"age\" >= $1 \
             ORDER BY main.\"name\" DESC LIMIT $2 OFFSET $3"
        );
        assert_eq!(q.params, vec![json!(18), json!(20), json!(40)]);
    }

    #[test]
    fn declared_columns_cast_numeric_and_placeholders() {
        let m = model();
        let orders = m.entity("orders").unwrap();
        let cond = Condition::compare("id", SqlOp::Eq, json!("67e55044-10b1-426f-9247-bb680e5fe0c8"));
        let q = select(
            &m,
            &SelectSpec {
                entity: orders,
                scope: DeletedScope::All,
                filter: Some(&cond),
                attributes: None,
                sort: &[],
                offset: None,
                limit: Some(1),
                includes: &[],
            },
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT main.\"id\", main.\"user_id\", main.\"total\"::text AS \"total\" FROM \"shop\".\"orders\" AS main \
             WHERE main.\"id\" = $1::uuid LIMIT $2"
        );
    }

    #[test]
    fn joined_and_required_includes() {
        let m = model();
        let users = m.entity("users").unwrap();
        let includes = vec![RelInclude {
            association: "orders".into(),
            attributes: Some(vec!["total".into()]),
            required: true,
            paranoid: true,
            separate: false,
            include: vec![],
        }];
        let q = select(
            &m,
            &SelectSpec {
                entity: users,
                scope: DeletedScope::Live,
                filter: None,
                attributes: None,
                sort: &[],
                offset: None,
                limit: None,
                includes: &includes,
            },
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT main.*, (SELECT COALESCE(json_agg(row_to_json(sub)), '[]'::json) FROM \
             (SELECT main_0.\"total\"::text AS \"total\" FROM \"shop\".\"orders\" AS main_0 \
             WHERE main_0.\"user_id\" = main.\"id\" AND main_0.\"deleted\" = FALSE) sub) AS \"orders\" \
             FROM \"users\" AS main WHERE main.\"deleted\" = FALSE AND EXISTS (SELECT 1 FROM \"shop\".\"orders\" AS main_r0 \
             WHERE main_r0.\"user_id\" = main.\"id\" AND main_r0.\"deleted\" = FALSE)"
        );
        assert!(q.params.is_empty());
    }

    #[test]
    fn separate_includes_are_not_joined() {
        let m = model();
        let users = m.entity("users").unwrap();
        let includes = vec![RelInclude {
            association: "orders".into(),
            attributes: None,
            required: false,
            paranoid: false,
            separate: true,
            include: vec![],
        }];
        let q = count(&m, users, DeletedScope::All, None, &includes).unwrap();
        assert_eq!(q.sql, "SELECT COUNT(*) AS \"count\" FROM \"users\" AS main");
    }

    #[test]
    fn unknown_association_is_a_validation_error() {
        let m = model();
        let users = m.entity("users").unwrap();
        let includes = vec![RelInclude {
            association: "nope".into(),
            attributes: None,
            required: false,
            paranoid: true,
            separate: false,
            include: vec![],
        }];
        // count only consults required includes
        assert!(count(&m, users, DeletedScope::Live, None, &includes).is_ok());
        let err = select(
            &m,
            &SelectSpec {
                entity: users,
                scope: DeletedScope::Live,
                filter: None,
                attributes: None,
                sort: &[],
                offset: None,
                limit: None,
                includes: &includes,
            },
        );
        assert!(matches!(err, Err(RuntimeError::Validation(_))));
    }

    #[test]
    fn insert_fills_defaults_and_timestamps() {
        let users = EntityDescriptor::new("users");
        let rows: Vec<Map<String, Value>> = vec![
            json!({ "name": "a", "created_by": 1 }).as_object().unwrap().clone(),
            json!({ "name": "b", "email": "b@x" }).as_object().unwrap().clone(),
        ];
        let q = insert(&users, "id", &rows);
        assert_eq!(
            q.sql,
            "INSERT INTO \"users\" AS main (\"name\", \"created_by\", \"email\", \"created_at\", \"updated_at\") \
             VALUES ($1, $2, DEFAULT, NOW(), NOW()), ($3, DEFAULT, $4, NOW(), NOW()) RETURNING main.*"
        );
        assert_eq!(q.params, vec![json!("a"), json!(1), json!("b"), json!("b@x")]);
    }

    #[test]
    fn insert_skips_undeclared_columns() {
        let orders = model().entity("orders").unwrap().clone();
        let rows = vec![json!({ "total": "9.50", "hack\"": 1, "created_by": 3 }).as_object().unwrap().clone()];
        let q = insert(&orders, "id", &rows);
        assert!(q.sql.starts_with("INSERT INTO \"shop\".\"orders\" AS main (\"total\", \"created_by\", \"created_at\", \"updated_at\") VALUES ($1::numeric, $2, NOW(), NOW())"));
    }

    #[test]
    fn update_never_touches_pk() {
        let users = EntityDescriptor::new("users");
        let changes = json!({ "id": 9, "active": false }).as_object().unwrap().clone();
        let cond = Condition::compare("id", SqlOp::Eq, json!(4));
        let q = update(&ResolvedModel::default(), &users, "id", DeletedScope::Live, &cond, &changes);
        assert_eq!(
            q.sql,
            "UPDATE \"users\" AS main SET \"active\" = $1, \"updated_at\" = NOW() \
             WHERE main.\"deleted\" = FALSE AND main.\"id\" = $2 RETURNING main.*"
        );
        assert_eq!(q.params, vec![json!(false), json!(4)]);
    }

    #[test]
    fn soft_delete_and_restore_statements() {
        let users = EntityDescriptor::new("users");
        let cond = Condition::compare("id", SqlOp::Eq, json!(4));
        let m = ResolvedModel::default();
        let del = set_deleted(&m, &users, DeletedScope::Live, &cond, true, Some(&json!(7)));
        assert_eq!(
            del.sql,
            "UPDATE \"users\" AS main SET \"deleted\" = TRUE, \"deleted_at\" = NOW(), \"deleted_by\" = $1, \
             \"updated_at\" = NOW() WHERE main.\"deleted\" = FALSE AND main.\"id\" = $2 RETURNING main.*"
        );
        let restore = set_deleted(&m, &users, DeletedScope::OnlyDeleted, &cond, false, None);
        assert_eq!(
            restore.sql,
            "UPDATE \"users\" AS main SET \"deleted\" = FALSE, \"deleted_at\" = NULL, \"deleted_by\" = NULL, \
             \"updated_at\" = NOW() WHERE main.\"deleted\" = TRUE AND main.\"id\" = $1 RETURNING main.*"
        );
    }

    #[test]
    fn condition_rendering_edge_cases() {
        let users = EntityDescriptor::new("users");
        let mut q = QueryBuf::new();
        let cond = Condition::And(vec![
            Condition::compare("a", SqlOp::In, json!([])),
            Condition::compare("b", SqlOp::NotIn, json!([1, 2])),
            Condition::compare("c", SqlOp::Is, json!(true)),
            Condition::compare("d", SqlOp::Ne, Value::Null),
            Condition::compare("author.name", SqlOp::ILike, json!("%x%")),
            Condition::Not(Box::new(Condition::Or(vec![]))),
        ]);
        assert_eq!(
            render_condition(&mut q, &ResolvedModel::default(), &users, MAIN_ALIAS, &cond),
            "(FALSE AND main.\"b\" NOT IN ($1, $2) AND main.\"c\" IS TRUE AND main.\"d\" IS NOT NULL \
             AND (main.\"author\" #>> '{name}') ILIKE $3 AND NOT (FALSE))"
        );
    }

    #[test]
    fn dotted_columns_follow_associations_or_json() {
        let m = model();
        let orders = m.entity("orders").unwrap();
        let mut q = QueryBuf::new();
        let cond = Condition::and(vec![
            Condition::compare("user.name", SqlOp::Eq, json!("ann")),
            Condition::compare("meta.size", SqlOp::Gt, json!(3)),
        ]);
        assert_eq!(
            render_condition(&mut q, &m, orders, MAIN_ALIAS, &cond),
            "(EXISTS (SELECT 1 FROM \"users\" AS main_v WHERE main_v.\"id\" = main.\"user_id\" AND main_v.\"name\" = $1) \
             AND main.\"meta\" #> '{size}' > to_jsonb($2))"
        );
        assert_eq!(q.params, vec![json!("ann"), json!(3)]);
    }

    #[test]
    fn aggregate_groups_and_rejects_unknown_functions() {
        let orders = model().entity("orders").unwrap().clone();
        let m = ResolvedModel::default();
        let q = aggregate(
            &m,
            &orders,
            DeletedScope::Live,
            None,
            &json!({ "groupBy": ["user_id"], "metrics": [{ "fn": "sum", "field": "total", "as": "revenue" }, { "fn": "count" }] }),
        )
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT main.\"user_id\", SUM(main.\"total\")::float8 AS \"revenue\", COUNT(*) AS \"count\" \
             FROM \"shop\".\"orders\" AS main WHERE main.\"deleted\" = FALSE GROUP BY main.\"user_id\""
        );
        assert!(aggregate(&m, &orders, DeletedScope::Live, None, &json!({ "metrics": [{ "fn": "median", "field": "x" }] })).is_err());
        assert!(aggregate(&m, &orders, DeletedScope::Live, None, &json!({ "metrics": [] })).is_err());
    }
}
