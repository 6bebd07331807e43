//! Input guards and owner stamping shared by every backend.

use crate::error::RuntimeError;
use crate::job::Job;
use crate::query::Dialect;
use serde_json::{Map, Value};

/// Most records a single bulk write accepts.
pub const BULK_LIMIT: usize = 100;

/// Fields clients never set directly.
const SYSTEM_FIELDS: &[&str] = &[
    "created_at",
    "created_by",
    "updated_at",
    "updated_by",
    "deleted",
    "deleted_at",
    "deleted_by",
];

pub fn require_body<D: Dialect>(job: &Job<D>) -> Result<&Map<String, Value>, RuntimeError> {
    if job.body.is_empty() {
        return Err(RuntimeError::Validation("body is required".into()));
    }
    Ok(&job.body)
}

pub fn require_id<D: Dialect>(job: &Job<D>) -> Result<&Value, RuntimeError> {
    match &job.id {
        Value::Null => Err(RuntimeError::Validation("id is required".into())),
        Value::String(s) if s.trim().is_empty() => Err(RuntimeError::Validation("id is required".into())),
        id => {
            check_scalar_id(id, "id")?;
            Ok(id)
        }
    }
}

/// Ids are plain values. An object or array would reach the backend as a predicate.
pub fn check_scalar_id(id: &Value, what: &str) -> Result<(), RuntimeError> {
    match id {
        Value::Object(_) | Value::Array(_) => Err(RuntimeError::Validation(format!("{} must be a scalar value", what))),
        _ => Ok(()),
    }
}

/// A filter that matches everything counts as missing.
pub fn require_where<D: Dialect>(job: &Job<D>) -> Result<&D::Filter, RuntimeError> {
    job.options
        .filter
        .as_ref()
        .filter(|f| !D::matches_all(f))
        .ok_or_else(|| RuntimeError::Validation("options.where is required".into()))
}

pub fn require_records<D: Dialect>(job: &Job<D>) -> Result<Vec<Map<String, Value>>, RuntimeError> {
    check_bulk_size(&job.records)?;
    job.records
        .iter()
        .enumerate()
        .map(|(i, r)| match r {
            Value::Object(map) => Ok(map.clone()),
            _ => Err(RuntimeError::Validation(format!("records[{}] must be an object", i))),
        })
        .collect()
}

pub fn check_bulk_size(records: &[Value]) -> Result<(), RuntimeError> {
    if records.is_empty() {
        return Err(RuntimeError::Validation("records are required".into()));
    }
    if records.len() > BULK_LIMIT {
        return Err(RuntimeError::Validation(format!(
            "at most {} records per bulk write, got {}",
            BULK_LIMIT,
            records.len()
        )));
    }
    Ok(())
}

/// New record: system fields stripped, `active`/`deleted` defaulted, owner recorded as
/// creator and last updater.
pub fn stamp_create(mut body: Map<String, Value>, owner: Option<&Value>) -> Map<String, Value> {
    for f in SYSTEM_FIELDS {
        body.remove(*f);
    }
    body.entry("active").or_insert(Value::Bool(true));
    body.insert("deleted".into(), Value::Bool(false));
    if let Some(owner) = owner {
        body.insert("created_by".into(), owner.clone());
        body.insert("updated_by".into(), owner.clone());
    }
    body
}

/// Changes for an update: pk and system fields stripped, owner recorded as last updater.
pub fn stamp_update(mut body: Map<String, Value>, pk: &str, owner: Option<&Value>) -> Map<String, Value> {
    body.remove(pk);
    for f in SYSTEM_FIELDS {
        body.remove(*f);
    }
    if let Some(owner) = owner {
        body.insert("updated_by".into(), owner.clone());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::relational::Relational;
    use serde_json::json;

    #[test]
    fn guards_reject_missing_inputs() {
        let job: Job<Relational> = Job::new("test");
        assert!(matches!(require_body(&job), Err(RuntimeError::Validation(_))));
        assert!(matches!(require_id(&job), Err(RuntimeError::Validation(_))));
        assert!(matches!(require_where(&job), Err(RuntimeError::Validation(_))));
        assert!(matches!(require_records(&job), Err(RuntimeError::Validation(_))));

        let job = job.with_id("  ");
        assert!(require_id(&job).is_err());
    }

    #[test]
    fn operator_shaped_ids_are_rejected() {
        let job: Job<Document> = Job::new("test").with_id(json!({ "$ne": null }));
        assert_eq!(require_id(&job).unwrap_err().to_string(), "id must be a scalar value");
        let job: Job<Document> = Job::new("test").with_id(json!(["a", "b"]));
        assert!(matches!(require_id(&job), Err(RuntimeError::Validation(_))));
        let job: Job<Document> = Job::new("test").with_id(42);
        assert_eq!(require_id(&job).unwrap(), &json!(42));
    }

    #[test]
    fn match_all_where_counts_as_missing() {
        let mut job: Job<Document> = Job::new("test");
        job.options.filter = Some(json!({}));
        assert!(require_where(&job).is_err());
        job.options.filter = Some(json!({ "email": "a@b.c" }));
        assert!(require_where(&job).is_ok());
    }

    #[test]
    fn bulk_limit() {
        let job: Job<Relational> = Job::new("test").with_records((0..=BULK_LIMIT).map(|i| json!({ "n": i })).collect());
        let err = require_records(&job).unwrap_err();
        assert!(err.to_string().contains("at most 100"));
        let job: Job<Relational> = Job::new("test").with_records(vec![json!({ "n": 1 }), json!(2)]);
        assert_eq!(require_records(&job).unwrap_err().to_string(), "records[1] must be an object");
    }

    #[test]
    fn stamping() {
        let body = json!({ "name": "a", "deleted": true, "created_at": "x", "active": false });
        let created = stamp_create(body.as_object().unwrap().clone(), Some(&json!(7)));
        assert_eq!(
            Value::Object(created),
            json!({ "name": "a", "active": false, "deleted": false, "created_by": 7, "updated_by": 7 })
        );

        let body = json!({ "id": 3, "name": "b", "created_by": 1 });
        let changes = stamp_update(body.as_object().unwrap().clone(), "id", None);
        assert_eq!(Value::Object(changes), json!({ "name": "b" }));
    }
}
