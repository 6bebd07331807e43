use crate::config::{EntityDescriptor, Settings};
use crate::error::RuntimeError;
use crate::job::{Job, JobData, JobResponse};
use crate::persistence::audit::{AuditEntry, AuditSink, NoopAuditSink};
use crate::persistence::guard::{
    check_bulk_size, check_scalar_id, require_body, require_id, require_records, require_where, stamp_create, stamp_update,
};
use crate::persistence::{Backend, Persistence};
use crate::query::{DeletedScope, Dialect, QueryOptions};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Persistence for one entity over any [`Backend`].
pub struct Repository<B: Backend> {
    pub(crate) backend: B,
    entity: EntityDescriptor,
    audit: Arc<dyn AuditSink>,
    settings: Settings,
}

type Filter<B> = <<B as Backend>::Dialect as Dialect>::Filter;

fn pk_value(row: &Value, pk: &str) -> Value {
    row.get(pk).cloned().unwrap_or(Value::Null)
}

impl<B: Backend> Repository<B> {
    pub fn new(backend: B, entity: EntityDescriptor) -> Self {
        Repository {
            backend,
            entity,
            audit: Arc::new(NoopAuditSink),
            settings: Settings::default(),
        }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The key `job.id` refers to: the job's pk unless it is the backend default and the
    /// entity declares its own.
    pub(crate) fn pk<'a>(&'a self, job: &'a Job<B::Dialect>) -> &'a str {
        if job.pk == <B::Dialect as Dialect>::DEFAULT_PK {
            self.entity.pk_or(&job.pk)
        } else {
            &job.pk
        }
    }

    pub(crate) fn entity_ref(&self) -> &EntityDescriptor {
        &self.entity
    }

    pub(crate) fn record_history(&self, pk: &str, row: &Value, action: &str, previous: Option<&Value>) {
        if !self.entity.history {
            return;
        }
        let mut entry = AuditEntry::history(
            &self.entity.name,
            pk_value(row, pk),
            action,
            row.clone(),
            self.settings.history_ttl(),
        );
        if let Some(previous) = previous {
            entry = entry.with_previous(previous.clone());
        }
        self.audit.record(entry);
    }

    fn record_trash(&self, pk: &str, rows: &[Value]) {
        if !self.entity.trash {
            return;
        }
        for row in rows {
            self.audit.record(AuditEntry::trash(
                &self.entity.name,
                pk_value(row, pk),
                row.clone(),
                self.settings.trash_ttl(),
            ));
        }
    }

    /// First live record matching `filter`, honoring the job's sort and transaction.
    async fn lookup(&self, job: &Job<B::Dialect>, filter: Filter<B>) -> Result<Option<Value>, RuntimeError> {
        let options = QueryOptions {
            filter: Some(filter),
            sort: job.options.sort.clone(),
            limit: Some(1),
            transaction: job.options.transaction.clone(),
            ..Default::default()
        };
        Ok(self
            .backend
            .select(&self.entity, &options, DeletedScope::Live)
            .await?
            .into_iter()
            .next())
    }

    /// Projected and populated single-record read in the job's deleted scope.
    async fn read_one(&self, job: &Job<B::Dialect>, filter: Filter<B>) -> Result<Option<Value>, RuntimeError> {
        let options = QueryOptions {
            filter: Some(filter),
            offset: None,
            limit: Some(1),
            ..job.options.clone()
        };
        let scope = DeletedScope::from_options(&job.options);
        Ok(self.backend.select(&self.entity, &options, scope).await?.into_iter().next())
    }

    fn found_or_empty(&self, found: Option<Value>, job: &Job<B::Dialect>, key: &str) -> JobResponse {
        match found {
            Some(row) => Ok(JobData::data(row)),
            None if job.options.allows_empty() => Ok(JobData::data(Value::Null)),
            None => Err(RuntimeError::not_found(&self.entity.name, key)),
        }
    }

    async fn insert_stamped(
        &self,
        job: &Job<B::Dialect>,
        rows: Vec<Map<String, Value>>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let pk = self.pk(job);
        let rows = rows.into_iter().map(|r| stamp_create(r, job.owner_id())).collect();
        let inserted = self
            .backend
            .insert(&self.entity, pk, rows, job.options.transaction.as_ref())
            .await?;
        for row in &inserted {
            self.record_history(pk, row, "create", None);
        }
        Ok(inserted)
    }

    async fn insert_one(&self, job: &Job<B::Dialect>, row: Map<String, Value>) -> Result<Value, RuntimeError> {
        self.insert_stamped(job, vec![row])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::Storage(format!("insert into {} returned no record", self.entity.name)))
    }

    /// Apply `body` to the record identified by `previous`'s pk; history gets both sides.
    async fn update_existing(
        &self,
        job: &Job<B::Dialect>,
        previous: Value,
        body: &Map<String, Value>,
    ) -> Result<JobData, RuntimeError> {
        let pk = self.pk(job);
        let id = pk_value(&previous, pk);
        let changes = stamp_update(body.clone(), pk, job.owner_id());
        let filter = B::id_filter(pk, std::slice::from_ref(&id));
        let updated = self
            .backend
            .update(&self.entity, pk, &filter, &changes, job.options.transaction.as_ref())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::not_found(&self.entity.name, display_id(&id)))?;
        self.record_history(pk, &updated, "update", Some(&previous));
        Ok(JobData::data(updated).with_previous(previous))
    }

    /// Soft or hard delete of everything `filter` matches.
    async fn delete_matching(&self, job: &Job<B::Dialect>, filter: &Filter<B>) -> Result<Vec<Value>, RuntimeError> {
        let tx = job.options.transaction.as_ref();
        if job.options.is_hard_delete() {
            let removed = self.backend.remove(&self.entity, filter, tx).await?;
            self.record_trash(self.pk(job), &removed);
            Ok(removed)
        } else {
            self.backend
                .set_deleted(&self.entity, filter, true, job.owner_id(), tx)
                .await
        }
    }
}

fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl<B: Backend> Persistence<B::Dialect> for Repository<B> {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }

    async fn find_all(&self, job: &Job<B::Dialect>) -> JobResponse {
        let scope = DeletedScope::from_options(&job.options);
        let offset = job.options.offset.unwrap_or(0);
        let limit = job.options.limit.unwrap_or(self.settings.default_limit);
        let options = QueryOptions {
            offset: Some(offset),
            limit: Some(limit),
            ..job.options.clone()
        };
        let rows = self.backend.select(&self.entity, &options, scope).await?;
        if !job.options.pagination.unwrap_or(true) {
            return Ok(JobData::data(Value::Array(rows)));
        }
        let count = self.backend.count(&self.entity, &job.options, scope).await?;
        Ok(JobData::data(Value::Array(rows))
            .with_count(count)
            .with_window(offset, limit))
    }

    async fn get_count(&self, job: &Job<B::Dialect>) -> JobResponse {
        let scope = DeletedScope::from_options(&job.options);
        let count = self.backend.count(&self.entity, &job.options, scope).await?;
        Ok(JobData::count_only(count))
    }

    async fn find_by_id(&self, job: &Job<B::Dialect>) -> JobResponse {
        let id = require_id(job)?;
        let mut filter = B::id_filter(self.pk(job), std::slice::from_ref(id));
        if let Some(extra) = job.options.filter.clone() {
            filter = <B::Dialect as Dialect>::conjoin(filter, extra);
        }
        let found = self.read_one(job, filter).await?;
        self.found_or_empty(found, job, &display_id(id))
    }

    async fn find_one(&self, job: &Job<B::Dialect>) -> JobResponse {
        let filter = require_where(job)?.clone();
        let found = self.read_one(job, filter).await?;
        self.found_or_empty(found, job, "where")
    }

    async fn create(&self, job: &Job<B::Dialect>) -> JobResponse {
        let body = require_body(job)?.clone();
        let row = self.insert_one(job, body).await?;
        Ok(JobData::data(row).with_created(true))
    }

    async fn create_bulk(&self, job: &Job<B::Dialect>) -> JobResponse {
        let rows = require_records(job)?;
        let inserted = self.insert_stamped(job, rows).await?;
        Ok(JobData::data(Value::Array(inserted)))
    }

    async fn update(&self, job: &Job<B::Dialect>) -> JobResponse {
        let id = require_id(job)?;
        let body = require_body(job)?;
        let pk = self.pk(job);
        let previous = self
            .lookup(job, B::id_filter(pk, std::slice::from_ref(id)))
            .await?
            .ok_or_else(|| RuntimeError::not_found(&self.entity.name, display_id(id)))?;
        self.update_existing(job, previous, body).await
    }

    async fn update_bulk(&self, job: &Job<B::Dialect>) -> JobResponse {
        let records = require_records(job)?;
        let pk = self.pk(job);
        let mut updated = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let id = record
                .get(pk)
                .filter(|v| !v.is_null())
                .ok_or_else(|| RuntimeError::Validation(format!("records[{}] is missing '{}'", i, pk)))?;
            check_scalar_id(id, &format!("records[{}].{}", i, pk))?;
            match self.lookup(job, B::id_filter(pk, std::slice::from_ref(id))).await? {
                Some(previous) => {
                    let data = self.update_existing(job, previous, record).await?;
                    updated.extend(data.data);
                }
                None => tracing::debug!(entity = %self.entity.name, id = %id, "bulk update skipped missing record"),
            }
        }
        Ok(JobData::data(Value::Array(updated)))
    }

    async fn find_and_update(&self, job: &Job<B::Dialect>) -> JobResponse {
        let filter = require_where(job)?.clone();
        let body = require_body(job)?;
        match self.lookup(job, filter).await? {
            Some(previous) => self.update_existing(job, previous, body).await,
            None if job.options.allows_empty() => Ok(JobData::data(Value::Null)),
            None => Err(RuntimeError::not_found(&self.entity.name, "where")),
        }
    }

    async fn delete(&self, job: &Job<B::Dialect>) -> JobResponse {
        let id = require_id(job)?;
        let filter = B::id_filter(self.pk(job), std::slice::from_ref(id));
        self.delete_matching(job, &filter)
            .await?
            .into_iter()
            .next()
            .map(JobData::data)
            .ok_or_else(|| RuntimeError::not_found(&self.entity.name, display_id(id)))
    }

    async fn find_and_delete(&self, job: &Job<B::Dialect>) -> JobResponse {
        let filter = require_where(job)?;
        let removed = self.delete_matching(job, filter).await?;
        Ok(JobData::data(Value::Array(removed)))
    }

    async fn delete_bulk(&self, job: &Job<B::Dialect>) -> JobResponse {
        let filter = match require_where(job) {
            Ok(filter) => filter.clone(),
            Err(_) if !job.records.is_empty() => {
                check_bulk_size(&job.records)?;
                let pk = self.pk(job);
                let ids: Vec<Value> = job
                    .records
                    .iter()
                    .map(|r| match r {
                        Value::Object(map) => map.get(pk).cloned().unwrap_or(Value::Null),
                        other => other.clone(),
                    })
                    .collect();
                if ids.iter().any(Value::is_null) {
                    return Err(RuntimeError::Validation(format!("every record needs '{}'", pk)));
                }
                for (i, id) in ids.iter().enumerate() {
                    check_scalar_id(id, &format!("records[{}]", i))?;
                }
                B::id_filter(pk, &ids)
            }
            Err(_) => return Err(RuntimeError::Validation("options.where or records is required".into())),
        };
        let removed = self.delete_matching(job, &filter).await?;
        let count = removed.len() as u64;
        Ok(JobData::data(Value::Array(removed)).with_count(count))
    }

    async fn restore(&self, job: &Job<B::Dialect>) -> JobResponse {
        let id = require_id(job)?;
        let filter = B::id_filter(self.pk(job), std::slice::from_ref(id));
        self.backend
            .set_deleted(&self.entity, &filter, false, job.owner_id(), job.options.transaction.as_ref())
            .await?
            .into_iter()
            .next()
            .map(JobData::data)
            .ok_or_else(|| RuntimeError::not_found(&self.entity.name, display_id(id)))
    }

    async fn find_or_create(&self, job: &Job<B::Dialect>) -> JobResponse {
        let filter = require_where(job)?;
        let body = require_body(job)?;
        if let Some(found) = self.lookup(job, filter.clone()).await? {
            return Ok(JobData::data(found).with_created(false));
        }
        let mut row = <B::Dialect as Dialect>::equalities(filter);
        row.extend(body.clone());
        let created = self.insert_one(job, row).await?;
        Ok(JobData::data(created).with_created(true))
    }

    async fn create_or_update(&self, job: &Job<B::Dialect>) -> JobResponse {
        let filter = require_where(job)?;
        let body = require_body(job)?;
        match self.lookup(job, filter.clone()).await? {
            Some(previous) => Ok(self.update_existing(job, previous, body).await?.with_created(false)),
            None => {
                let mut row = <B::Dialect as Dialect>::equalities(filter);
                row.extend(body.clone());
                let created = self.insert_one(job, row).await?;
                Ok(JobData::data(created).with_created(true))
            }
        }
    }

    async fn aggregate(&self, job: &Job<B::Dialect>) -> JobResponse {
        let spec = job
            .options
            .aggregate
            .as_ref()
            .ok_or_else(|| RuntimeError::Validation("options.aggregate is required".into()))?;
        let scope = DeletedScope::from_options(&job.options);
        let data = self.backend.aggregate(&self.entity, spec, &job.options, scope).await?;
        Ok(JobData::data(data))
    }
}
