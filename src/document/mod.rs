//! Document backend: Mongo-style collections behind a [`DocumentStore`].

mod dialect;
pub mod matcher;
mod memory;
mod store;

pub use dialect::{live_filter, only_deleted_filter, DocPopulate, Document};
pub use memory::{run_pipeline, MemoryDocumentStore};
pub use store::{DocumentStore, FindOptions};

use crate::config::{AssociationDirection, EntityDescriptor, ResolvedModel};
use crate::error::RuntimeError;
use crate::job::{Job, JobData, JobResponse};
use crate::persistence::{require_body, require_id, AuditEntry, AuditSink, Backend, Repository};
use crate::query::{sanitize_field, DeletedScope, Dialect, QueryOptions};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type DocumentRepository<S> = Repository<DocumentBackend<S>>;

fn now() -> Value {
    Value::String(chrono::Utc::now().to_rfc3339())
}

fn scope_filter(scope: DeletedScope) -> Value {
    match scope {
        DeletedScope::Live => live_filter(),
        DeletedScope::OnlyDeleted => only_deleted_filter(),
        DeletedScope::All => Value::Object(Map::new()),
    }
}

fn unknown_association(entity: &EntityDescriptor, name: &str) -> RuntimeError {
    RuntimeError::Validation(format!("unknown association '{}' on {}", name, entity.name))
}

/// Storage primitives expressed as document-store calls. Population always runs as
/// batched follow-up queries, one per association level.
pub struct DocumentBackend<S: DocumentStore> {
    store: S,
    model: Arc<ResolvedModel>,
}

impl<S: DocumentStore> DocumentBackend<S> {
    pub fn new(store: S, model: Arc<ResolvedModel>) -> Self {
        DocumentBackend { store, model }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn populate<'a>(
        &'a self,
        entity: &'a EntityDescriptor,
        docs: &'a mut Vec<Value>,
        specs: &'a [DocPopulate],
    ) -> Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            for spec in specs {
                let assoc = entity
                    .association(&spec.path)
                    .ok_or_else(|| unknown_association(entity, &spec.path))?;
                let target = self
                    .model
                    .entity(&assoc.target)
                    .ok_or_else(|| unknown_association(entity, &spec.path))?;

                let mut keys: Vec<Value> = Vec::new();
                for doc in docs.iter() {
                    if let Some(k) = doc.get(&assoc.local_key).filter(|k| !k.is_null()) {
                        if !keys.contains(k) {
                            keys.push(k.clone());
                        }
                    }
                }
                let mut children = Vec::new();
                if !keys.is_empty() {
                    let mut filter = json!({ assoc.foreign_key.clone(): { "$in": keys } });
                    if let Some(extra) = &spec.match_ {
                        filter = Document::conjoin(filter, extra.clone());
                    }
                    let projection = spec.select.clone().map(|mut fields| {
                        fields.push(assoc.foreign_key.clone());
                        fields.extend(spec.populate.iter().filter_map(|c| {
                            target.association(&c.path).map(|a| a.local_key.clone())
                        }));
                        fields
                    });
                    let options = FindOptions {
                        projection,
                        ..Default::default()
                    };
                    children = self.store.find(&target.table_name, &filter, &options).await?;
                    if !spec.populate.is_empty() && !children.is_empty() {
                        self.populate(target, &mut children, &spec.populate).await?;
                    }
                }

                for doc in docs.iter_mut() {
                    let key = doc.get(&assoc.local_key).cloned().unwrap_or(Value::Null);
                    let mut related = children
                        .iter()
                        .filter(|c| !key.is_null() && c.get(&assoc.foreign_key) == Some(&key))
                        .cloned();
                    let attached = match assoc.direction {
                        AssociationDirection::ToOne => related.next().unwrap_or(Value::Null),
                        AssociationDirection::ToMany => Value::Array(related.collect()),
                    };
                    if let Value::Object(map) = doc {
                        map.insert(spec.path.clone(), attached);
                    }
                }
                if spec.required {
                    docs.retain(|d| match d.get(&spec.path) {
                        Some(Value::Array(items)) => !items.is_empty(),
                        Some(v) => !v.is_null(),
                        None => false,
                    });
                }
            }
            Ok(())
        })
    }

    /// Semi-join for required populate nodes: parents whose key has at least one matching
    /// related document. Applied before windowing so pages and counts agree.
    async fn required_clause(
        &self,
        entity: &EntityDescriptor,
        includes: &[DocPopulate],
    ) -> Result<Option<Value>, RuntimeError> {
        let mut clause: Option<Value> = None;
        for spec in includes.iter().filter(|s| s.required) {
            let assoc = entity
                .association(&spec.path)
                .ok_or_else(|| unknown_association(entity, &spec.path))?;
            let target = self
                .model
                .entity(&assoc.target)
                .ok_or_else(|| unknown_association(entity, &spec.path))?;
            let filter = spec.match_.clone().unwrap_or_else(|| Value::Object(Map::new()));
            let options = FindOptions {
                projection: Some(vec![assoc.foreign_key.clone()]),
                ..Default::default()
            };
            let mut keys: Vec<Value> = Vec::new();
            for doc in self.store.find(&target.table_name, &filter, &options).await? {
                if let Some(k) = doc.get(&assoc.foreign_key).filter(|k| !k.is_null()) {
                    if !keys.contains(k) {
                        keys.push(k.clone());
                    }
                }
            }
            let part = json!({ assoc.local_key.clone(): { "$in": keys } });
            clause = Some(match clause {
                Some(c) => Document::conjoin(c, part),
                None => part,
            });
        }
        Ok(clause)
    }

    async fn primary_filter(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Document>,
        scope: DeletedScope,
    ) -> Result<Value, RuntimeError> {
        let filter = scoped(scope, options.filter.as_ref());
        let includes: &[DocPopulate] = options.include.as_deref().unwrap_or(&[]);
        Ok(match self.required_clause(entity, includes).await? {
            Some(required) => Document::conjoin(filter, required),
            None => filter,
        })
    }
}

fn scoped(scope: DeletedScope, filter: Option<&Value>) -> Value {
    match filter {
        Some(f) => Document::conjoin(scope_filter(scope), f.clone()),
        None => scope_filter(scope),
    }
}

#[async_trait]
impl<S: DocumentStore> Backend for DocumentBackend<S> {
    type Dialect = Document;

    fn id_filter(pk: &str, ids: &[Value]) -> Value {
        let mut filter = Map::new();
        let cond = match ids {
            [id] => id.clone(),
            _ => json!({ "$in": ids }),
        };
        filter.insert(pk.to_string(), cond);
        Value::Object(filter)
    }

    async fn select(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Document>,
        scope: DeletedScope,
    ) -> Result<Vec<Value>, RuntimeError> {
        let includes: &[DocPopulate] = options.include.as_deref().unwrap_or(&[]);
        let projection = options.attributes.clone().map(|mut fields| {
            fields.extend(
                includes
                    .iter()
                    .filter_map(|i| entity.association(&i.path).map(|a| a.local_key.clone())),
            );
            fields
        });
        let find = FindOptions {
            sort: options.sort.clone(),
            skip: options.offset.unwrap_or(0),
            limit: options.limit,
            projection,
        };
        let filter = self.primary_filter(entity, options, scope).await?;
        let mut docs = self.store.find(&entity.table_name, &filter, &find).await?;
        if !includes.is_empty() && !docs.is_empty() {
            self.populate(entity, &mut docs, includes).await?;
        }
        Ok(docs)
    }

    async fn count(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Document>,
        scope: DeletedScope,
    ) -> Result<u64, RuntimeError> {
        let filter = self.primary_filter(entity, options, scope).await?;
        self.store.count(&entity.table_name, &filter).await
    }

    async fn insert(
        &self,
        entity: &EntityDescriptor,
        _pk: &str,
        rows: Vec<Map<String, Value>>,
        _tx: Option<&Infallible>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let ts = now();
        let docs = rows
            .into_iter()
            .map(|mut row| {
                row.entry("created_at").or_insert_with(|| ts.clone());
                row.entry("updated_at").or_insert_with(|| ts.clone());
                Value::Object(row)
            })
            .collect();
        self.store.insert_many(&entity.table_name, docs).await
    }

    async fn update(
        &self,
        entity: &EntityDescriptor,
        _pk: &str,
        filter: &Value,
        changes: &Map<String, Value>,
        _tx: Option<&Infallible>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let mut set = changes.clone();
        set.insert("updated_at".into(), now());
        let filter = scoped(DeletedScope::Live, Some(filter));
        self.store
            .update_many(&entity.table_name, &filter, &json!({ "$set": set }))
            .await
    }

    async fn set_deleted(
        &self,
        entity: &EntityDescriptor,
        filter: &Value,
        deleted: bool,
        actor: Option<&Value>,
        _tx: Option<&Infallible>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let ts = now();
        let (scope, set) = if deleted {
            (
                DeletedScope::Live,
                json!({
                    "deleted": true,
                    "deleted_at": ts,
                    "deleted_by": actor.cloned().unwrap_or(Value::Null),
                    "updated_at": ts,
                }),
            )
        } else {
            let mut set = json!({
                "deleted": false,
                "deleted_at": null,
                "deleted_by": null,
                "updated_at": ts,
            });
            if let (Some(actor), Value::Object(map)) = (actor, &mut set) {
                map.insert("updated_by".into(), actor.clone());
            }
            (DeletedScope::OnlyDeleted, set)
        };
        let filter = scoped(scope, Some(filter));
        self.store
            .update_many(&entity.table_name, &filter, &json!({ "$set": set }))
            .await
    }

    async fn remove(
        &self,
        entity: &EntityDescriptor,
        filter: &Value,
        _tx: Option<&Infallible>,
    ) -> Result<Vec<Value>, RuntimeError> {
        self.store.delete_many(&entity.table_name, filter).await
    }

    async fn aggregate(
        &self,
        entity: &EntityDescriptor,
        spec: &Value,
        options: &QueryOptions<Document>,
        scope: DeletedScope,
    ) -> Result<Value, RuntimeError> {
        let stages = spec
            .as_array()
            .ok_or_else(|| RuntimeError::Validation("aggregate expects a pipeline array".into()))?;
        let mut pipeline = Vec::with_capacity(stages.len() + 1);
        pipeline.push(json!({ "$match": scoped(scope, options.filter.as_ref()) }));
        pipeline.extend(stages.iter().cloned());
        let out = self.store.aggregate(&entity.table_name, &pipeline).await?;
        Ok(Value::Array(out))
    }
}

impl<S: DocumentStore> Repository<DocumentBackend<S>> {
    /// Push `job.body` onto the array `field` of the live record `job.id`. The pushed
    /// sub-document gets an `_id` if it has none.
    pub async fn add_sub_document(&self, job: &Job<Document>, field: &str) -> JobResponse {
        let id = require_id(job)?;
        let mut item = require_body(job)?.clone();
        item.entry("_id")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        self.sub_document_update(job, id, field, "$push", Value::Object(item)).await
    }

    /// Pull every element of `field` matching `job.body` from the live record `job.id`.
    pub async fn remove_sub_document(&self, job: &Job<Document>, field: &str) -> JobResponse {
        let id = require_id(job)?;
        let cond = require_body(job)?.clone();
        self.sub_document_update(job, id, field, "$pull", Value::Object(cond)).await
    }

    async fn sub_document_update(
        &self,
        job: &Job<Document>,
        id: &Value,
        field: &str,
        op: &str,
        operand: Value,
    ) -> JobResponse {
        let field = sanitize_field(field);
        if field.is_empty() {
            return Err(RuntimeError::Validation("sub-document field is required".into()));
        }
        let pk = self.pk(job);
        let entity = self.entity_ref();
        let mut set = Map::new();
        set.insert("updated_at".into(), now());
        if let Some(owner) = job.owner_id() {
            set.insert("updated_by".into(), owner.clone());
        }
        let mut target = Map::new();
        target.insert(field, operand);
        let mut update = Map::new();
        update.insert(op.to_string(), Value::Object(target));
        update.insert("$set".into(), Value::Object(set));

        let filter = scoped(
            DeletedScope::Live,
            Some(&DocumentBackend::<S>::id_filter(pk, std::slice::from_ref(id))),
        );
        let updated = self
            .backend
            .store
            .update_many(&entity.table_name, &filter, &Value::Object(update))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::not_found(&entity.name, id.as_str().map_or_else(|| id.to_string(), String::from)))?;
        self.record_history(pk, &updated, "update", None);
        Ok(JobData::data(updated))
    }
}

/// Writes audit entries into `history_logs` / `trash_logs` collections on a spawned task.
pub struct DocumentAuditSink<S: DocumentStore + 'static> {
    store: Arc<S>,
}

impl<S: DocumentStore + 'static> DocumentAuditSink<S> {
    pub fn new(store: Arc<S>) -> Self {
        DocumentAuditSink { store }
    }
}

impl<S: DocumentStore + 'static> AuditSink for DocumentAuditSink<S> {
    fn record(&self, entry: AuditEntry) {
        let doc = match serde_json::to_value(&entry) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(entity = %entry.entity, error = %e, "audit entry not serializable");
                return;
            }
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert_many(entry.kind.target(), vec![doc]).await {
                tracing::warn!(entity = %entry.entity, kind = ?entry.kind, error = %e, "audit write failed");
            }
        });
    }
}
