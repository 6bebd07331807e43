//! Record SDK: one CRUD operation set over relational and document storage.
//!
//! A caller builds a [`Job`], hands it to a [`RecordService`], and gets back a
//! [`JobResponse`]. The service compiles the job's payload into backend-native
//! [`QueryOptions`], runs [`LifecycleHooks`] around the operation and delegates to a
//! [`Persistence`] implementation ([`RelationalRepository`] or [`DocumentRepository`]).

pub mod config;
pub mod document;
pub mod error;
pub mod job;
pub mod persistence;
pub mod populate;
pub mod query;
pub mod relational;
pub mod response;
pub mod service;

pub use config::{resolve, load_from_path, EntityConfig, EntityDescriptor, ResolvedModel, Settings};
pub use document::{Document, DocumentAuditSink, DocumentBackend, DocumentRepository, DocumentStore, MemoryDocumentStore};
pub use error::{ConfigError, RuntimeError};
pub use job::{IntoJob, Job, JobData, JobInit, JobResponse, Owner, Payload};
pub use persistence::{AuditSink, MemoryAuditSink, Persistence, Repository};
pub use query::{DeletedScope, Dialect, QueryOptions};
pub use relational::{ensure_audit_tables, PgExecutor, Relational, RelationalRepository, SqlAuditSink, SqlBackend};
pub use response::{envelope, error_body};
pub use service::{LifecycleHooks, NoHooks, RecordService};
