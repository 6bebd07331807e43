//! Payload to backend-native options. Pure functions; nothing here fails.

use crate::job::Payload;
use crate::populate::build_populate_tree;
use crate::query::projection::{sanitize_field, split_select, Projection};
use crate::query::sort::parse_sort;
use crate::query::{Dialect, QueryOptions};
use serde_json::Value;

/// Hard cap on page size; also what `limit = -1` means.
pub const MAX_LIMIT: u64 = 1000;

/// Per-call inputs the payload does not carry.
#[derive(Clone, Copy, Debug)]
pub struct CompileContext<'a> {
    pub search_fields: &'a [String],
    pub default_limit: u64,
}

/// `-1` means "all" (capped), absent or non-positive falls back to the default.
pub fn resolve_limit(limit: Option<i64>, default_limit: u64) -> u64 {
    match limit {
        Some(-1) => MAX_LIMIT,
        Some(n) if n > 0 => (n as u64).min(MAX_LIMIT),
        _ => default_limit.min(MAX_LIMIT),
    }
}

fn compile_filter<D: Dialect>(payload: &Payload, search_fields: &[String]) -> Option<D::Filter> {
    let explicit = payload.where_.as_ref().filter(|w| !w.is_null()).map(D::translate_where);
    let term = payload.search.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let search = match term {
        Some(term) if !search_fields.is_empty() => Some(D::search(search_fields, term)),
        _ => None,
    };
    match (explicit, search) {
        (Some(w), Some(s)) => Some(D::conjoin(w, s)),
        (w, s) => w.or(s),
    }
}

/// Populate entries are strings ("a.b*") or objects `{ "path": "a.b", "select": [...] }`.
fn populate_paths(populate: &Value, projection: &mut Projection) -> Vec<String> {
    let items: Vec<&Value> = match populate {
        Value::Array(items) => items.iter().collect(),
        Value::String(_) | Value::Object(_) => vec![populate],
        _ => return Vec::new(),
    };
    let mut paths = Vec::new();
    for item in items {
        match item {
            Value::String(s) => paths.extend(s.split(',').map(|p| p.trim().to_string())),
            Value::Object(obj) => {
                let Some(path) = obj.get("path").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(select) = obj.get("select") {
                    let bare = path.trim_start_matches(['+', '-']).trim_end_matches('*');
                    let attrs: Vec<String> = split_select(select).own;
                    if !attrs.is_empty() {
                        projection.associations.insert(sanitize_field(bare), attrs);
                    }
                }
                paths.push(path.to_string());
            }
            _ => {}
        }
    }
    paths
}

fn compile_include<D: Dialect>(payload: &Payload, projection: &mut Projection) -> Option<D::Include> {
    let populate = payload.populate.as_ref()?;
    let paths = populate_paths(populate, projection);
    if paths.is_empty() {
        return None;
    }
    let tree = build_populate_tree(&paths, &projection.associations);
    (!tree.is_empty()).then(|| D::serialize_populate(tree))
}

fn compile_sort<D: Dialect>(payload: &Payload) -> Option<D::Sort> {
    let keys = parse_sort(payload.sort.as_ref()?);
    (!keys.is_empty()).then(|| D::fold_sort(keys))
}

/// Options for findAll / getCount / findById / findOne.
pub fn compile_read_options<D: Dialect>(
    payload: &Payload,
    existing: QueryOptions<D>,
    ctx: &CompileContext<'_>,
) -> QueryOptions<D> {
    let mut projection = payload.select.as_ref().map(split_select).unwrap_or_default();
    let include = compile_include::<D>(payload, &mut projection);
    let compiled = QueryOptions {
        filter: compile_filter::<D>(payload, ctx.search_fields),
        attributes: (!projection.own.is_empty()).then(|| projection.own.clone()),
        include,
        sort: compile_sort::<D>(payload),
        offset: Some(payload.offset.unwrap_or(0).max(0) as u64),
        limit: Some(resolve_limit(payload.limit, ctx.default_limit)),
        pagination: Some(payload.pagination.unwrap_or(true)),
        with_deleted: payload.with_deleted,
        only_deleted: payload.only_deleted,
        allow_empty: payload.allow_empty,
        hard_delete: None,
        aggregate: payload.aggregate.clone(),
        transaction: None,
    };
    existing.overlay(compiled)
}

/// Options for create / update and the combined lookup-then-write operations.
pub fn compile_write_options<D: Dialect>(
    payload: &Payload,
    existing: QueryOptions<D>,
    ctx: &CompileContext<'_>,
) -> QueryOptions<D> {
    let compiled = QueryOptions {
        filter: compile_filter::<D>(payload, ctx.search_fields),
        allow_empty: payload.allow_empty,
        ..Default::default()
    };
    existing.overlay(compiled)
}

/// Options for delete / findAndDelete / deleteBulk / restore.
pub fn compile_delete_options<D: Dialect>(
    payload: &Payload,
    existing: QueryOptions<D>,
    ctx: &CompileContext<'_>,
) -> QueryOptions<D> {
    let compiled = QueryOptions {
        filter: compile_filter::<D>(payload, ctx.search_fields),
        hard_delete: payload.is_hard_mode().then_some(true),
        allow_empty: payload.allow_empty,
        ..Default::default()
    };
    existing.overlay(compiled)
}
