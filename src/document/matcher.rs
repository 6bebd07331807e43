//! Mongo-style filter evaluation, updates, sorting and projection over JSON documents.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Value at a dotted path. Arrays along the way are not traversed.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Some(map) = doc.as_object_mut() else { return };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map.entry(head.to_string()).or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value);
        }
    }
}

fn remove_path(doc: &mut Value, path: &str) {
    match path.rsplit_once('.') {
        Some((parent, last)) => {
            if let Some(Value::Object(map)) = get_path_mut(doc, parent) {
                map.remove(last);
            }
        }
        None => {
            if let Value::Object(map) = doc {
                map.remove(path);
            }
        }
    }
}

fn get_path_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(doc, |cur, seg| match cur {
        Value::Object(map) => map.get_mut(seg),
        _ => None,
    })
}

/// Total order used for `$gt`-style comparisons and sorting: numbers, strings and bools
/// compare within their own kind; mixed kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Equality with array-field semantics: an array matches if it equals the operand or
/// any element does.
fn eq_matches(field: Option<&Value>, operand: &Value) -> bool {
    match field {
        None => operand.is_null(),
        Some(Value::Array(items)) if !operand.is_array() => items.iter().any(|i| values_equal(i, operand)),
        Some(v) => values_equal(v, operand),
    }
}

fn regex_matches(field: Option<&Value>, pattern: &str, options: &str) -> bool {
    let Ok(re) = regex::RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .build()
    else {
        return false;
    };
    match field {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items.iter().any(|i| i.as_str().is_some_and(|s| re.is_match(s))),
        _ => false,
    }
}

fn cmp_matches(field: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    match field {
        Some(Value::Array(items)) => items
            .iter()
            .any(|i| compare_values(i, operand).is_some_and(accept)),
        Some(v) => compare_values(v, operand).is_some_and(accept),
        None => false,
    }
}

fn is_operator_object(v: &Value) -> bool {
    matches!(v, Value::Object(m) if !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn field_matches(field: Option<&Value>, condition: &Value) -> bool {
    if !is_operator_object(condition) {
        return eq_matches(field, condition);
    }
    let Value::Object(ops) = condition else {
        return false;
    };
    ops.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => eq_matches(field, operand),
        "$ne" => !eq_matches(field, operand),
        "$gt" => cmp_matches(field, operand, |o| o == Ordering::Greater),
        "$gte" => cmp_matches(field, operand, |o| o != Ordering::Less),
        "$lt" => cmp_matches(field, operand, |o| o == Ordering::Less),
        "$lte" => cmp_matches(field, operand, |o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|items| items.iter().any(|i| eq_matches(field, i))),
        "$nin" => operand
            .as_array()
            .is_some_and(|items| !items.iter().any(|i| eq_matches(field, i))),
        "$exists" => field.is_some() == operand.as_bool().unwrap_or(true),
        "$regex" => {
            let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
            operand.as_str().is_some_and(|p| regex_matches(field, p, options))
        }
        "$options" => true,
        "$not" => !field_matches(field, operand),
        _ => false,
    })
}

/// Does `doc` satisfy `filter`? Unknown top-level operators never match.
pub fn matches(doc: &Value, filter: &Value) -> bool {
    let Value::Object(clauses) = filter else {
        return false;
    };
    clauses.iter().all(|(key, cond)| match key.as_str() {
        "$and" => cond
            .as_array()
            .is_some_and(|parts| parts.iter().all(|p| matches(doc, p))),
        "$or" => cond
            .as_array()
            .is_some_and(|parts| parts.iter().any(|p| matches(doc, p))),
        "$nor" => cond
            .as_array()
            .is_some_and(|parts| !parts.iter().any(|p| matches(doc, p))),
        k if k.starts_with('$') => false,
        path => field_matches(get_path(doc, path), cond),
    })
}

/// Apply `$set`, `$unset`, `$push` and `$pull`. A document without operators replaces
/// nothing; unknown operators are ignored.
pub fn apply_update(doc: &mut Value, update: &Value) {
    let Value::Object(ops) = update else { return };
    for (op, fields) in ops {
        let Value::Object(fields) = fields else { continue };
        for (path, v) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, v.clone()),
                "$unset" => remove_path(doc, path),
                "$push" => {
                    if !get_path(doc, path).is_some_and(Value::is_array) {
                        set_path(doc, path, Value::Array(Vec::new()));
                    }
                    if let Some(Value::Array(items)) = get_path_mut(doc, path) {
                        items.push(v.clone());
                    }
                }
                "$pull" => {
                    if let Some(Value::Array(items)) = get_path_mut(doc, path) {
                        items.retain(|item| !pull_matches(item, v));
                    }
                }
                _ => {}
            }
        }
    }
}

/// `$pull` condition: operator object against the element, plain object as a sub-document
/// filter, anything else as equality.
fn pull_matches(item: &Value, cond: &Value) -> bool {
    if is_operator_object(cond) {
        field_matches(Some(item), cond)
    } else if cond.is_object() && item.is_object() {
        matches(item, cond)
    } else {
        values_equal(item, cond)
    }
}

/// Stable sort by `{field: 1 | -1}` keys in order. Missing fields sort first ascending.
pub fn sort_documents(docs: &mut [Value], sort: &Map<String, Value>) {
    docs.sort_by(|a, b| {
        for (field, dir) in sort {
            let ord = match (get_path(a, field), get_path(b, field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            };
            let ord = if dir.as_i64().unwrap_or(1) < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Keep only `fields` (top-level or dotted) plus `keep`.
pub fn project(doc: &Value, fields: &[String], keep: &[&str]) -> Value {
    let mut out = Value::Object(Map::new());
    for path in fields.iter().map(String::as_str).chain(keep.iter().copied()) {
        if let Some(v) = get_path(doc, path) {
            set_path(&mut out, path, v.clone());
        }
    }
    out
}
