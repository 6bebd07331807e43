//! `select` splitting into own and association attributes.

use serde_json::Value;
use std::collections::HashMap;

/// Keep only `[A-Za-z0-9_.]`; free-text query params must not reach identifiers.
pub fn sanitize_field(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection {
    /// Fields of the primary record, in first-seen order.
    pub own: Vec<String>,
    /// Association path ("author" or "author.profile") to projected fields.
    pub associations: HashMap<String, Vec<String>>,
}

fn select_items(select: &Value) -> Vec<String> {
    match select {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Split `["name", "author.name", "author.profile.city"]` into own `["name"]` and
/// `{"author": ["name"], "author.profile": ["city"]}`. Accepts a comma string too.
pub fn split_select(select: &Value) -> Projection {
    let mut out = Projection::default();
    for raw in select_items(select) {
        let field = sanitize_field(&raw);
        if field.is_empty() || field.contains("..") {
            continue;
        }
        match field.rsplit_once('.') {
            Some((path, attr)) => {
                let attrs = out.associations.entry(path.to_string()).or_default();
                if !attrs.iter().any(|a| a == attr) {
                    attrs.push(attr.to_string());
                }
            }
            None => {
                if !out.own.contains(&field) {
                    out.own.push(field);
                }
            }
        }
    }
    out
}
