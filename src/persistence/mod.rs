//! Persistence operations: one operation set, identical across backends.
//!
//! [`Repository`] owns the semantics (guards, stamping, soft delete, audit, not-found
//! handling); a [`Backend`] only supplies storage primitives in its own dialect.

pub mod audit;
mod guard;
mod repository;

pub use audit::{AuditEntry, AuditKind, AuditSink, MemoryAuditSink, NoopAuditSink};
pub use guard::{
    check_bulk_size, check_scalar_id, require_body, require_id, require_records, require_where, stamp_create, stamp_update,
    BULK_LIMIT,
};
pub use repository::Repository;

use crate::config::EntityDescriptor;
use crate::error::RuntimeError;
use crate::job::{Job, JobResponse};
use crate::query::{DeletedScope, Dialect, QueryOptions};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// The canonical operation set for one entity.
#[async_trait]
pub trait Persistence<D: Dialect>: Send + Sync {
    fn entity(&self) -> &EntityDescriptor;

    async fn find_all(&self, job: &Job<D>) -> JobResponse;
    async fn get_count(&self, job: &Job<D>) -> JobResponse;
    async fn find_by_id(&self, job: &Job<D>) -> JobResponse;
    async fn find_one(&self, job: &Job<D>) -> JobResponse;
    async fn create(&self, job: &Job<D>) -> JobResponse;
    async fn create_bulk(&self, job: &Job<D>) -> JobResponse;
    async fn update(&self, job: &Job<D>) -> JobResponse;
    async fn update_bulk(&self, job: &Job<D>) -> JobResponse;
    async fn find_and_update(&self, job: &Job<D>) -> JobResponse;
    async fn delete(&self, job: &Job<D>) -> JobResponse;
    async fn find_and_delete(&self, job: &Job<D>) -> JobResponse;
    async fn delete_bulk(&self, job: &Job<D>) -> JobResponse;
    async fn restore(&self, job: &Job<D>) -> JobResponse;
    /// Lookup then insert. Two concurrent callers can both miss and both insert unless the job
    /// carries a transaction at a suitable isolation level or a unique index covers the filter.
    async fn find_or_create(&self, job: &Job<D>) -> JobResponse;
    /// Lookup then insert or update, with the same race as `find_or_create`.
    async fn create_or_update(&self, job: &Job<D>) -> JobResponse;
    async fn aggregate(&self, job: &Job<D>) -> JobResponse;
}

/// Storage primitives a backend adapter provides. Every mutating primitive returns the
/// affected records as they are after the write (or, for removal, as they were).
#[async_trait]
pub trait Backend: Send + Sync {
    type Dialect: Dialect;

    /// Predicate selecting records whose `pk` is one of `ids`.
    fn id_filter(pk: &str, ids: &[Value]) -> <Self::Dialect as Dialect>::Filter;

    /// Filtered, projected, sorted, windowed and populated read.
    async fn select(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Self::Dialect>,
        scope: DeletedScope,
    ) -> Result<Vec<Value>, RuntimeError>;

    async fn count(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Self::Dialect>,
        scope: DeletedScope,
    ) -> Result<u64, RuntimeError>;

    async fn insert(
        &self,
        entity: &EntityDescriptor,
        pk: &str,
        rows: Vec<Map<String, Value>>,
        tx: Option<&<Self::Dialect as Dialect>::Transaction>,
    ) -> Result<Vec<Value>, RuntimeError>;

    async fn update(
        &self,
        entity: &EntityDescriptor,
        pk: &str,
        filter: &<Self::Dialect as Dialect>::Filter,
        changes: &Map<String, Value>,
        tx: Option<&<Self::Dialect as Dialect>::Transaction>,
    ) -> Result<Vec<Value>, RuntimeError>;

    /// Soft delete (`deleted = true`, stamping `deleted_by`) or restore (`deleted = false`,
    /// stamping `updated_by`). Soft delete sees live records, restore only deleted ones.
    async fn set_deleted(
        &self,
        entity: &EntityDescriptor,
        filter: &<Self::Dialect as Dialect>::Filter,
        deleted: bool,
        actor: Option<&Value>,
        tx: Option<&<Self::Dialect as Dialect>::Transaction>,
    ) -> Result<Vec<Value>, RuntimeError>;

    /// Physical removal regardless of the soft-delete marker.
    async fn remove(
        &self,
        entity: &EntityDescriptor,
        filter: &<Self::Dialect as Dialect>::Filter,
        tx: Option<&<Self::Dialect as Dialect>::Transaction>,
    ) -> Result<Vec<Value>, RuntimeError>;

    async fn aggregate(
        &self,
        entity: &EntityDescriptor,
        spec: &Value,
        options: &QueryOptions<Self::Dialect>,
        scope: DeletedScope,
    ) -> Result<Value, RuntimeError>;
}
