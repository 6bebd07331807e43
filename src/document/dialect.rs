//! Document dialect: Mongo-style filter objects, key-ordered sort maps, populate specs.

use crate::populate::PopulateNode;
use crate::query::{sanitize_field, Dialect, SortKey};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::convert::Infallible;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Document;

/// Populate spec for one association, applied by batched follow-up queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocPopulate {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    /// Extra filter on the populated documents; hides soft-deleted ones unless `+`.
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_: Option<Value>,
    pub required: bool,
    pub separate: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub populate: Vec<DocPopulate>,
}

/// Filter clause hiding soft-deleted documents.
pub fn live_filter() -> Value {
    json!({ "deleted": { "$ne": true } })
}

pub fn only_deleted_filter() -> Value {
    json!({ "deleted": true })
}

fn populate_from(node: PopulateNode) -> DocPopulate {
    DocPopulate {
        path: node.path,
        select: node.attributes,
        match_: (!node.include_deleted).then(live_filter),
        required: node.required,
        separate: node.fetch_separately,
        populate: node.children.into_iter().map(populate_from).collect(),
    }
}

fn is_empty_object(v: &Value) -> bool {
    matches!(v, Value::Object(m) if m.is_empty())
}

impl Dialect for Document {
    type Filter = Value;
    type Sort = Map<String, Value>;
    type Include = Vec<DocPopulate>;
    /// The in-process store has no transactions.
    type Transaction = Infallible;

    const DEFAULT_PK: &'static str = "_id";

    fn translate_where(tree: &Value) -> Value {
        match tree {
            Value::Object(_) => tree.clone(),
            other => {
                tracing::warn!(tree = %other, "malformed where, using empty predicate");
                Value::Object(Map::new())
            }
        }
    }

    fn search(fields: &[String], term: &str) -> Value {
        let pattern = regex::escape(term);
        let clauses: Vec<Value> = fields
            .iter()
            .map(|f| sanitize_field(f))
            .filter(|f| !f.is_empty())
            .map(|f| {
                let mut clause = Map::new();
                clause.insert(f, json!({ "$regex": pattern, "$options": "i" }));
                Value::Object(clause)
            })
            .collect();
        json!({ "$or": clauses })
    }

    fn conjoin(left: Value, right: Value) -> Value {
        if is_empty_object(&left) {
            return right;
        }
        if is_empty_object(&right) {
            return left;
        }
        json!({ "$and": [left, right] })
    }

    fn matches_all(filter: &Value) -> bool {
        is_empty_object(filter)
    }

    fn fold_sort(keys: Vec<SortKey>) -> Map<String, Value> {
        let mut sort = Map::new();
        for key in keys {
            sort.insert(key.field, Value::from(key.direction.as_i64()));
        }
        sort
    }

    fn serialize_populate(tree: Vec<PopulateNode>) -> Vec<DocPopulate> {
        tree.into_iter().map(populate_from).collect()
    }

    fn equalities(filter: &Value) -> Map<String, Value> {
        let mut out = Map::new();
        if let Value::Object(map) = filter {
            for (k, v) in map {
                if k == "$and" {
                    if let Value::Array(parts) = v {
                        for part in parts {
                            out.extend(Self::equalities(part));
                        }
                    }
                    continue;
                }
                let operator_object = matches!(v, Value::Object(m) if m.keys().any(|k| k.starts_with('$')));
                if !k.starts_with('$') && !k.contains('.') && !v.is_null() && !operator_object {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }
}
