//! In-process document engine over `tokio::sync::RwLock`.

use crate::document::matcher::{apply_update, compare_values, get_path, matches, project, sort_documents};
use crate::document::store::{DocumentStore, FindOptions};
use crate::error::RuntimeError;
use async_trait::async_trait;
use serde_json::{json, Map, Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored document in a collection, including soft-deleted ones.
    pub async fn dump(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

fn storage(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::Storage(msg.into())
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(&self, collection: &str, filter: &Value, options: &FindOptions) -> Result<Vec<Value>, RuntimeError> {
        let guard = self.collections.read().await;
        let mut docs: Vec<Value> = guard
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches(d, filter)).cloned().collect())
            .unwrap_or_default();
        drop(guard);
        if let Some(sort) = &options.sort {
            sort_documents(&mut docs, sort);
        }
        let window = docs
            .into_iter()
            .skip(options.skip as usize)
            .take(options.limit.map(|l| l as usize).unwrap_or(usize::MAX));
        Ok(match &options.projection {
            Some(fields) => window.map(|d| project(&d, fields, &["_id"])).collect(),
            None => window.collect(),
        })
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, RuntimeError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches(d, filter)).count())
            .unwrap_or(0) as u64)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        let mut guard = self.collections.write().await;
        let stored = guard.entry(collection.to_string()).or_default();
        let mut prepared = Vec::with_capacity(docs.len());
        for doc in docs {
            let Value::Object(mut map) = doc else {
                return Err(storage("documents must be objects"));
            };
            let id = map
                .entry("_id")
                .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()))
                .clone();
            let clash = stored.iter().chain(prepared.iter()).any(|d: &Value| d.get("_id") == Some(&id));
            if clash {
                return Err(storage(format!("duplicate key _id {} in {}", id, collection)));
            }
            prepared.push(Value::Object(map));
        }
        stored.extend(prepared.iter().cloned());
        Ok(prepared)
    }

    async fn update_many(&self, collection: &str, filter: &Value, update: &Value) -> Result<Vec<Value>, RuntimeError> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(Vec::new());
        };
        let mut updated = Vec::new();
        for doc in docs.iter_mut().filter(|d| matches(d, filter)) {
            apply_update(doc, update);
            updated.push(doc.clone());
        }
        Ok(updated)
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, RuntimeError> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Value>, Vec<Value>) = docs.drain(..).partition(|d| matches(d, filter));
        *docs = kept;
        Ok(removed)
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let docs = self.dump(collection).await;
        run_pipeline(docs, pipeline)
    }
}

fn count_arg(spec: &Value, stage: &str) -> Result<usize, RuntimeError> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| storage(format!("{} expects a non-negative integer", stage)))
}

/// Runs `$match $sort $skip $limit $project $count $group` stages in order.
pub fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Value]) -> Result<Vec<Value>, RuntimeError> {
    for stage in pipeline {
        let (name, spec) = stage
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| storage("each pipeline stage needs exactly one operator"))?;
        docs = match name.as_str() {
            "$match" => docs.into_iter().filter(|d| matches(d, spec)).collect(),
            "$sort" => {
                let sort = spec.as_object().ok_or_else(|| storage("$sort expects an object"))?;
                sort_documents(&mut docs, sort);
                docs
            }
            "$skip" => docs.into_iter().skip(count_arg(spec, "$skip")?).collect(),
            "$limit" => docs.into_iter().take(count_arg(spec, "$limit")?).collect(),
            "$project" => {
                let fields: Vec<String> = spec
                    .as_object()
                    .ok_or_else(|| storage("$project expects an object"))?
                    .iter()
                    .filter(|(_, v)| v.as_i64() == Some(1) || v.as_bool() == Some(true))
                    .map(|(k, _)| k.clone())
                    .collect();
                docs.iter().map(|d| project(d, &fields, &["_id"])).collect()
            }
            "$count" => {
                let field = spec.as_str().ok_or_else(|| storage("$count expects a field name"))?;
                let mut out = Map::new();
                out.insert(field.to_string(), json!(docs.len()));
                vec![Value::Object(out)]
            }
            "$group" => group(docs, spec)?,
            other => return Err(storage(format!("unsupported pipeline stage {}", other))),
        };
    }
    Ok(docs)
}

/// `"$field"` reads from the document; anything else is a literal. Objects evaluate per key.
fn eval(doc: &Value, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => get_path(doc, &s[1..]).cloned().unwrap_or(Value::Null),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), eval(doc, v))).collect()),
        other => other.clone(),
    }
}

fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < 9_007_199_254_740_992.0 {
        Value::from(x as i64)
    } else {
        Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn accumulate(op: &str, arg: &Value, docs: &[Value]) -> Result<Value, RuntimeError> {
    let values = || docs.iter().map(|d| eval(d, arg));
    Ok(match op {
        "$sum" => number(values().filter_map(|v| v.as_f64()).sum()),
        "$avg" => {
            let nums: Vec<f64> = values().filter_map(|v| v.as_f64()).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                number(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "$min" | "$max" => {
            let want = if op == "$min" { Ordering::Less } else { Ordering::Greater };
            values()
                .filter(|v| !v.is_null())
                .fold(None, |best: Option<Value>, v| {
                    let replace = best.as_ref().map_or(true, |b| compare_values(&v, b) == Some(want));
                    if replace {
                        Some(v)
                    } else {
                        best
                    }
                })
                .unwrap_or(Value::Null)
        }
        "$push" => Value::Array(values().collect()),
        "$first" => values().next().unwrap_or(Value::Null),
        "$count" => json!(docs.len()),
        other => return Err(storage(format!("unsupported accumulator {}", other))),
    })
}

fn group(docs: Vec<Value>, spec: &Value) -> Result<Vec<Value>, RuntimeError> {
    let spec = spec.as_object().ok_or_else(|| storage("$group expects an object"))?;
    let key_expr = spec.get("_id").ok_or_else(|| storage("$group needs _id"))?;
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for doc in docs {
        let key = eval(&doc, key_expr);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }
    let mut out = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row = Map::new();
        row.insert("_id".into(), key);
        for (field, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            let (op, arg) = acc
                .as_object()
                .filter(|m| m.len() == 1)
                .and_then(|m| m.iter().next())
                .ok_or_else(|| storage(format!("accumulator for {} needs exactly one operator", field)))?;
            row.insert(field.clone(), accumulate(op, arg, &members)?);
        }
        out.push(Value::Object(row));
    }
    Ok(out)
}
