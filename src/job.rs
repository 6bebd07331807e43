//! Job envelope: the normalized unit of work threaded through compiler, hooks and persistence.

use crate::error::RuntimeError;
use crate::query::{Dialect, QueryOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller identity. Only `id` is used (for `created_by`/`updated_by`/`deleted_by`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub id: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Owner {
    pub fn new(id: impl Into<Value>) -> Self {
        Owner {
            id: id.into(),
            extra: Map::new(),
        }
    }
}

/// Raw, loosely-typed client query. Every field is optional and unparsable shapes are
/// tolerated here; the compiler decides what survives.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Payload {
    pub select: Option<Value>,
    #[serde(rename = "where")]
    pub where_: Option<Value>,
    pub populate: Option<Value>,
    pub sort: Option<Value>,
    pub search: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    /// `"soft"` (default) or `"hard"`.
    pub mode: Option<String>,
    pub with_deleted: Option<bool>,
    pub only_deleted: Option<bool>,
    pub allow_empty: Option<bool>,
    pub pagination: Option<bool>,
    pub aggregate: Option<Value>,
}

impl Payload {
    pub fn is_hard_mode(&self) -> bool {
        self.mode
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case("hard"))
            .unwrap_or(false)
    }
}

/// Plain-object form of a job, as received from a caller or deserialized from JSON.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JobInit {
    pub action: Option<String>,
    pub owner: Option<Owner>,
    pub pk: Option<String>,
    pub id: Option<Value>,
    pub body: Option<Map<String, Value>>,
    pub records: Option<Vec<Value>>,
    pub payload: Option<Payload>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Job<D: Dialect> {
    /// Calling use-case; only hooks branch on it.
    pub action: String,
    pub owner: Option<Owner>,
    pub pk: String,
    pub id: Value,
    pub body: Map<String, Value>,
    pub records: Vec<Value>,
    pub payload: Payload,
    pub options: QueryOptions<D>,
}

impl<D: Dialect> Job<D> {
    pub fn new(action: &str) -> Self {
        Job {
            action: action.to_string(),
            owner: None,
            pk: D::DEFAULT_PK.to_string(),
            id: Value::Null,
            body: Map::new(),
            records: Vec::new(),
            payload: Payload::default(),
            options: QueryOptions::default(),
        }
    }

    pub fn from_init(init: JobInit) -> Self {
        Job {
            action: init.action.unwrap_or_default(),
            owner: init.owner,
            pk: init
                .pk
                .filter(|pk| !pk.is_empty())
                .unwrap_or_else(|| D::DEFAULT_PK.to_string()),
            id: init.id.unwrap_or(Value::Null),
            body: init.body.unwrap_or_default(),
            records: init.records.unwrap_or_default(),
            payload: init.payload.unwrap_or_default(),
            options: QueryOptions::default(),
        }
    }

    /// Fill the one default a hand-built Job can lack. Running it twice changes nothing.
    pub fn normalize(mut self) -> Self {
        if self.pk.is_empty() {
            self.pk = D::DEFAULT_PK.to_string();
        }
        self
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        if let Value::Object(map) = body {
            self.body = map;
        }
        self
    }

    pub fn with_records(mut self, records: Vec<Value>) -> Self {
        self.records = records;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_options(mut self, options: QueryOptions<D>) -> Self {
        self.options = options;
        self
    }

    pub fn owner_id(&self) -> Option<&Value> {
        self.owner.as_ref().map(|o| &o.id).filter(|id| !id.is_null())
    }
}

/// Anything a pipeline entry point accepts as a job.
pub trait IntoJob<D: Dialect> {
    fn into_job(self) -> Result<Job<D>, RuntimeError>;
}

impl<D: Dialect> IntoJob<D> for Job<D> {
    fn into_job(self) -> Result<Job<D>, RuntimeError> {
        Ok(self.normalize())
    }
}

impl<D: Dialect> IntoJob<D> for JobInit {
    fn into_job(self) -> Result<Job<D>, RuntimeError> {
        Ok(Job::from_init(self))
    }
}

impl<D: Dialect> IntoJob<D> for Value {
    fn into_job(self) -> Result<Job<D>, RuntimeError> {
        let init: JobInit = serde_json::from_value(self)
            .map_err(|e| RuntimeError::Validation(format!("invalid job: {}", e)))?;
        Ok(Job::from_init(init))
    }
}

/// Success half of the response envelope. `data` is absent only on count-only responses.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Value>,
}

impl JobData {
    pub fn data(data: Value) -> Self {
        JobData {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn count_only(count: u64) -> Self {
        JobData {
            count: Some(count),
            ..Default::default()
        }
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_window(mut self, offset: u64, limit: u64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn with_created(mut self, created: bool) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous_data = Some(previous);
        self
    }
}

/// Exactly one of `{error}` or `{data, ...extra}`.
pub type JobResponse = Result<JobData, RuntimeError>;
