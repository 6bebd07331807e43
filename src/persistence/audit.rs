//! Append-only history and trash records. Writes are best-effort: a sink never reports
//! failure to the operation that produced the entry.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    History,
    Trash,
}

impl AuditKind {
    /// Table / collection the entry lands in.
    pub fn target(self) -> &'static str {
        match self {
            AuditKind::History => "history_logs",
            AuditKind::Trash => "trash_logs",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditEntry {
    #[serde(skip)]
    pub kind: AuditKind,
    pub entity: String,
    pub entity_id: Value,
    pub action: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Value>,
    pub expire_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn history(entity: &str, entity_id: Value, action: &str, data: Value, ttl: Duration) -> Self {
        AuditEntry {
            kind: AuditKind::History,
            entity: entity.to_string(),
            entity_id,
            action: action.to_string(),
            data,
            previous_data: None,
            expire_at: Utc::now() + ttl,
        }
    }

    pub fn trash(entity: &str, entity_id: Value, data: Value, ttl: Duration) -> Self {
        AuditEntry {
            kind: AuditKind::Trash,
            entity: entity.to_string(),
            entity_id,
            action: "delete".to_string(),
            data,
            previous_data: None,
            expire_at: Utc::now() + ttl,
        }
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous_data = Some(previous);
        self
    }

    /// `entity_id` as stored text: strings unquoted, everything else JSON-encoded.
    pub fn entity_id_text(&self) -> String {
        match &self.entity_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    /// Fire-and-forget. Implementations log their own failures.
    fn record(&self, entry: AuditEntry);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _entry: AuditEntry) {}
}

/// Keeps entries in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.entries
            .lock()
            .map(|e| e.iter().filter(|x| x.kind == kind).count())
            .unwrap_or(0)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(_) => tracing::warn!(entity = %entry.entity, "audit buffer poisoned, entry dropped"),
        }
    }
}
