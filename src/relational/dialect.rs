//! Relational dialect: operator aliases to a typed condition tree, nested includes.

use crate::populate::PopulateNode;
use crate::query::{sanitize_field, Dialect, SortKey};
use crate::relational::executor::PgTransaction;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Relational;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Is,
    Like,
    NotLike,
    ILike,
    NotILike,
}

/// Symbolic `where` keys accepted from clients and the native operator each becomes.
/// `$or`, `$and` and `$not` are structural and handled separately.
pub const OPERATOR_ALIASES: &[(&str, SqlOp)] = &[
    ("$eq", SqlOp::Eq),
    ("$ne", SqlOp::Ne),
    ("$gt", SqlOp::Gt),
    ("$gte", SqlOp::Gte),
    ("$lt", SqlOp::Lt),
    ("$lte", SqlOp::Lte),
    ("$in", SqlOp::In),
    ("$notIn", SqlOp::NotIn),
    ("$is", SqlOp::Is),
    ("$like", SqlOp::Like),
    ("$notLike", SqlOp::NotLike),
    ("$iLike", SqlOp::ILike),
    ("$notILike", SqlOp::NotILike),
];

fn alias(key: &str) -> Option<SqlOp> {
    OPERATOR_ALIASES.iter().find(|(k, _)| *k == key).map(|(_, op)| *op)
}

/// Native predicate. A column containing a dot ("author.name") is a cross-association
/// reference rendered as a qualified identifier.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Empty `And` is TRUE.
    And(Vec<Condition>),
    /// Empty `Or` is FALSE.
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Compare { column: String, op: SqlOp, value: Value },
}

impl Condition {
    pub fn compare(column: &str, op: SqlOp, value: Value) -> Self {
        Condition::Compare {
            column: column.to_string(),
            op,
            value,
        }
    }

    /// Conjunction that flattens nested `And`s and collapses a single operand.
    pub fn and(parts: Vec<Condition>) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Condition::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Condition::And(Vec::new()))
        } else {
            Condition::And(flat)
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Condition::And(parts) if parts.is_empty())
    }
}

/// One node of the include tree handed to the SQL builder.
#[derive(Clone, Debug, PartialEq)]
pub struct RelInclude {
    pub association: String,
    pub attributes: Option<Vec<String>>,
    /// Inner-join semantics: parents without a match are dropped.
    pub required: bool,
    /// Filter out soft-deleted children.
    pub paranoid: bool,
    /// Batched follow-up query instead of a correlated subquery.
    pub separate: bool,
    pub include: Vec<RelInclude>,
}

struct Malformed;

fn list_items(value: &Value) -> Result<Vec<Value>, Malformed> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                Value::Object(single)
            })
            .collect()),
        _ => Err(Malformed),
    }
}

fn column_name(key: &str) -> Result<String, Malformed> {
    // `$assoc.field$` is the virtual-column form.
    let inner = match key.strip_prefix('$').and_then(|k| k.strip_suffix('$')) {
        Some(inner) if !inner.is_empty() => inner,
        _ => key,
    };
    let column = sanitize_field(inner);
    if column.is_empty() {
        Err(Malformed)
    } else {
        Ok(column)
    }
}

fn translate_object(value: &Value) -> Result<Condition, Malformed> {
    let Value::Object(map) = value else {
        return Err(Malformed);
    };
    let mut parts = Vec::with_capacity(map.len());
    for (key, v) in map {
        let part = match key.as_str() {
            "$or" => Condition::Or(
                list_items(v)?
                    .iter()
                    .map(translate_object)
                    .collect::<Result<_, _>>()?,
            ),
            "$and" => Condition::and(
                list_items(v)?
                    .iter()
                    .map(translate_object)
                    .collect::<Result<_, _>>()?,
            ),
            "$not" => Condition::Not(Box::new(translate_object(v)?)),
            k if k.starts_with('$') && !(k.len() > 2 && k.ends_with('$')) => return Err(Malformed),
            k => column_condition(&column_name(k)?, v)?,
        };
        parts.push(part);
    }
    Ok(Condition::and(parts))
}

fn column_condition(column: &str, value: &Value) -> Result<Condition, Malformed> {
    match value {
        Value::Null => Ok(Condition::compare(column, SqlOp::Is, Value::Null)),
        Value::Array(_) => Ok(Condition::compare(column, SqlOp::In, value.clone())),
        Value::Object(map) if map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => {
            let mut parts = Vec::with_capacity(map.len());
            for (key, v) in map {
                let part = match key.as_str() {
                    "$or" => Condition::Or(
                        operand_items(v)?
                            .iter()
                            .map(|item| column_condition(column, item))
                            .collect::<Result<_, _>>()?,
                    ),
                    "$and" => Condition::and(
                        operand_items(v)?
                            .iter()
                            .map(|item| column_condition(column, item))
                            .collect::<Result<_, _>>()?,
                    ),
                    "$not" => Condition::Not(Box::new(column_condition(column, v)?)),
                    k => {
                        let op = alias(k).ok_or(Malformed)?;
                        if matches!(op, SqlOp::In | SqlOp::NotIn) && !v.is_array() {
                            return Err(Malformed);
                        }
                        Condition::compare(column, op, v.clone())
                    }
                };
                parts.push(part);
            }
            Ok(Condition::and(parts))
        }
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => Err(Malformed),
        Value::Object(map) => {
            // Plain nested keys address a sub-path of the column.
            let mut parts = Vec::with_capacity(map.len());
            for (key, v) in map {
                let sub = format!("{}.{}", column, column_name(key)?);
                parts.push(column_condition(&sub, v)?);
            }
            Ok(Condition::and(parts))
        }
        scalar => Ok(Condition::compare(column, SqlOp::Eq, scalar.clone())),
    }
}

/// `$or` under a column: an array of values/operator objects, or an operator object.
fn operand_items(value: &Value) -> Result<Vec<Value>, Malformed> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(_) => list_items(value),
        _ => Err(Malformed),
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn include_from(node: PopulateNode) -> RelInclude {
    RelInclude {
        association: node.path,
        attributes: node.attributes,
        required: node.required,
        paranoid: !node.include_deleted,
        separate: node.fetch_separately,
        include: node.children.into_iter().map(include_from).collect(),
    }
}

fn collect_equalities(cond: &Condition, out: &mut Map<String, Value>) {
    match cond {
        Condition::And(parts) => parts.iter().for_each(|p| collect_equalities(p, out)),
        Condition::Compare {
            column,
            op: SqlOp::Eq,
            value,
        } if !column.contains('.') && !value.is_null() => {
            out.insert(column.clone(), value.clone());
        }
        _ => {}
    }
}

impl Dialect for Relational {
    type Filter = Condition;
    type Sort = Vec<SortKey>;
    type Include = Vec<RelInclude>;
    type Transaction = PgTransaction;

    const DEFAULT_PK: &'static str = "id";

    fn translate_where(tree: &Value) -> Condition {
        translate_object(tree).unwrap_or_else(|_| {
            tracing::warn!(tree = %tree, "malformed where, using empty predicate");
            Condition::And(Vec::new())
        })
    }

    fn search(fields: &[String], term: &str) -> Condition {
        let pattern = Value::String(format!("%{}%", escape_like(term)));
        Condition::Or(
            fields
                .iter()
                .map(|f| sanitize_field(f))
                .filter(|f| !f.is_empty())
                .map(|f| Condition::compare(&f, SqlOp::ILike, pattern.clone()))
                .collect(),
        )
    }

    fn conjoin(left: Condition, right: Condition) -> Condition {
        Condition::and(vec![left, right])
    }

    fn matches_all(filter: &Condition) -> bool {
        filter.is_empty()
    }

    fn fold_sort(keys: Vec<SortKey>) -> Vec<SortKey> {
        keys
    }

    fn serialize_populate(tree: Vec<PopulateNode>) -> Vec<RelInclude> {
        tree.into_iter().map(include_from).collect()
    }

    fn equalities(filter: &Condition) -> Map<String, Value> {
        let mut out = Map::new();
        collect_equalities(filter, &mut out);
        out
    }
}
