//! Response envelope: `{error}` or `{data, ...}`, never both.

use crate::error::RuntimeError;
use crate::job::JobResponse;
use serde_json::{json, Value};

pub fn error_body(code: &str, message: String) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message
        }
    })
}

/// Plain-object form of a [`JobResponse`], for callers that hand results across a boundary.
pub fn envelope(res: &JobResponse) -> Value {
    match res {
        Ok(data) => serde_json::to_value(data).unwrap_or_else(|e| {
            let err = RuntimeError::Storage(format!("unserializable response: {}", e));
            error_body(err.code(), err.to_string())
        }),
        Err(err) => error_body(err.code(), err.to_string()),
    }
}
