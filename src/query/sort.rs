//! Sort payload parsing.

use crate::query::projection::sanitize_field;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" | "1" => Some(SortDirection::Asc),
                "desc" | "descending" | "-1" => Some(SortDirection::Desc),
                _ => None,
            },
            Value::Number(n) => match n.as_i64() {
                Some(1) => Some(SortDirection::Asc),
                Some(-1) => Some(SortDirection::Desc),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

fn pair(v: &Value) -> Option<SortKey> {
    let arr = v.as_array()?;
    let field = sanitize_field(arr.first()?.as_str()?);
    if field.is_empty() {
        return None;
    }
    let direction = match arr.get(1) {
        Some(d) => SortDirection::parse(d)?,
        None => SortDirection::Asc,
    };
    Some(SortKey { field, direction })
}

/// Accepts `["field", "desc"]`, `[["a", "asc"], ["b", "desc"]]`, `"field"` / `"-field"`,
/// or `{ "field": -1 }`. Unparsable entries are dropped.
pub fn parse_sort(v: &Value) -> Vec<SortKey> {
    match v {
        Value::String(s) => {
            let (field, direction) = match s.strip_prefix('-') {
                Some(rest) => (rest, SortDirection::Desc),
                None => (s.as_str(), SortDirection::Asc),
            };
            let field = sanitize_field(field);
            if field.is_empty() {
                Vec::new()
            } else {
                vec![SortKey { field, direction }]
            }
        }
        Value::Array(items) if items.first().map(Value::is_string).unwrap_or(false) => {
            pair(v).into_iter().collect()
        }
        Value::Array(items) => items.iter().filter_map(pair).collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, d)| {
                let field = sanitize_field(k);
                let direction = SortDirection::parse(d)?;
                (!field.is_empty()).then_some(SortKey { field, direction })
            })
            .collect(),
        _ => Vec::new(),
    }
}
