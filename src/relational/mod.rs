//! Relational backend: PostgreSQL through sqlx.

pub mod builder;
mod dialect;
mod executor;
mod params;

pub use builder::QueryBuf;
pub use dialect::{Condition, RelInclude, Relational, SqlOp, OPERATOR_ALIASES};
pub use executor::{PgExecutor, PgTransaction, SqlExecutor};
pub use params::PgBindValue;

use crate::config::{AssociationDirection, EntityDescriptor, ResolvedModel};
use crate::error::RuntimeError;
use crate::persistence::{AuditEntry, AuditSink, Backend, Repository};
use crate::query::{DeletedScope, QueryOptions};
use async_trait::async_trait;
use builder::SelectSpec;
use serde_json::{Map, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

pub type RelationalRepository<E> = Repository<SqlBackend<E>>;

/// Storage primitives rendered as SQL and run through a [`SqlExecutor`].
pub struct SqlBackend<E: SqlExecutor> {
    executor: E,
    model: Arc<ResolvedModel>,
}

impl<E: SqlExecutor> SqlBackend<E> {
    pub fn new(executor: E, model: Arc<ResolvedModel>) -> Self {
        SqlBackend { executor, model }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Batched follow-up queries for includes marked `separate`, attached in place.
    async fn populate_separate(
        &self,
        entity: &EntityDescriptor,
        rows: &mut [Value],
        includes: &[RelInclude],
        tx: Option<&PgTransaction>,
    ) -> Result<(), RuntimeError> {
        for inc in includes.iter().filter(|i| i.separate) {
            let assoc = entity.association(&inc.association).ok_or_else(|| {
                RuntimeError::Validation(format!("unknown association '{}' on {}", inc.association, entity.name))
            })?;
            let target = self.model.entity(&assoc.target).ok_or_else(|| {
                RuntimeError::Validation(format!("unknown entity '{}'", assoc.target))
            })?;
            let mut keys: Vec<Value> = Vec::new();
            for row in rows.iter() {
                if let Some(k) = row.get(&assoc.local_key).filter(|k| !k.is_null()) {
                    if !keys.contains(k) {
                        keys.push(k.clone());
                    }
                }
            }
            let mut grouped: HashMap<String, Vec<Value>> = HashMap::new();
            if !keys.is_empty() {
                let q = builder::select_by_column_in(&self.model, target, &assoc.foreign_key, &keys, inc)?;
                for child in self.executor.fetch_all(&q, tx).await? {
                    let key = child.get(&assoc.foreign_key).map(Value::to_string).unwrap_or_default();
                    grouped.entry(key).or_default().push(child);
                }
            }
            for row in rows.iter_mut() {
                let key = row.get(&assoc.local_key).map(Value::to_string).unwrap_or_default();
                let children = grouped.get(&key).cloned().unwrap_or_default();
                let attached = match assoc.direction {
                    AssociationDirection::ToOne => children.into_iter().next().unwrap_or(Value::Null),
                    AssociationDirection::ToMany => Value::Array(children),
                };
                if let Value::Object(map) = row {
                    map.insert(inc.association.clone(), attached);
                }
            }
        }
        Ok(())
    }
}

/// Separate includes are matched on the parent's local key, so a projection must carry it.
fn with_join_keys(entity: &EntityDescriptor, attributes: &[String], includes: &[RelInclude]) -> Vec<String> {
    let mut out = attributes.to_vec();
    if out.is_empty() {
        return out;
    }
    for inc in includes.iter().filter(|i| i.separate) {
        if let Some(assoc) = entity.association(&inc.association) {
            if !out.contains(&assoc.local_key) {
                out.push(assoc.local_key.clone());
            }
        }
    }
    out
}

#[async_trait]
impl<E: SqlExecutor> Backend for SqlBackend<E> {
    type Dialect = Relational;

    fn id_filter(pk: &str, ids: &[Value]) -> Condition {
        match ids {
            [id] => Condition::compare(pk, SqlOp::Eq, id.clone()),
            _ => Condition::compare(pk, SqlOp::In, Value::Array(ids.to_vec())),
        }
    }

    async fn select(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Relational>,
        scope: DeletedScope,
    ) -> Result<Vec<Value>, RuntimeError> {
        let includes: &[RelInclude] = options.include.as_deref().unwrap_or(&[]);
        let attributes = options
            .attributes
            .as_ref()
            .map(|attrs| with_join_keys(entity, attrs, includes));
        let q = builder::select(
            &self.model,
            &SelectSpec {
                entity,
                scope,
                filter: options.filter.as_ref(),
                attributes: attributes.as_deref(),
                sort: options.sort.as_deref().unwrap_or(&[]),
                offset: options.offset,
                limit: options.limit,
                includes,
            },
        )?;
        let tx = options.transaction.as_ref();
        let mut rows = self.executor.fetch_all(&q, tx).await?;
        if includes.iter().any(|i| i.separate) && !rows.is_empty() {
            self.populate_separate(entity, &mut rows, includes, tx).await?;
        }
        Ok(rows)
    }

    async fn count(
        &self,
        entity: &EntityDescriptor,
        options: &QueryOptions<Relational>,
        scope: DeletedScope,
    ) -> Result<u64, RuntimeError> {
        let includes: &[RelInclude] = options.include.as_deref().unwrap_or(&[]);
        let q = builder::count(&self.model, entity, scope, options.filter.as_ref(), includes)?;
        let row = self.executor.fetch_optional(&q, options.transaction.as_ref()).await?;
        Ok(row
            .as_ref()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as u64)
    }

    async fn insert(
        &self,
        entity: &EntityDescriptor,
        pk: &str,
        rows: Vec<Map<String, Value>>,
        tx: Option<&PgTransaction>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let q = builder::insert(entity, pk, &rows);
        self.executor.fetch_all(&q, tx).await
    }

    async fn update(
        &self,
        entity: &EntityDescriptor,
        pk: &str,
        filter: &Condition,
        changes: &Map<String, Value>,
        tx: Option<&PgTransaction>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let q = builder::update(&self.model, entity, pk, DeletedScope::Live, filter, changes);
        self.executor.fetch_all(&q, tx).await
    }

    async fn set_deleted(
        &self,
        entity: &EntityDescriptor,
        filter: &Condition,
        deleted: bool,
        actor: Option<&Value>,
        tx: Option<&PgTransaction>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let scope = if deleted { DeletedScope::Live } else { DeletedScope::OnlyDeleted };
        let q = builder::set_deleted(&self.model, entity, scope, filter, deleted, actor);
        self.executor.fetch_all(&q, tx).await
    }

    async fn remove(
        &self,
        entity: &EntityDescriptor,
        filter: &Condition,
        tx: Option<&PgTransaction>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let q = builder::delete(&self.model, entity, DeletedScope::All, filter);
        self.executor.fetch_all(&q, tx).await
    }

    async fn aggregate(
        &self,
        entity: &EntityDescriptor,
        spec: &Value,
        options: &QueryOptions<Relational>,
        scope: DeletedScope,
    ) -> Result<Value, RuntimeError> {
        let q = builder::aggregate(&self.model, entity, scope, options.filter.as_ref(), spec)?;
        Ok(Value::Array(self.executor.fetch_all(&q, options.transaction.as_ref()).await?))
    }
}

/// History and trash tables, created if missing.
pub async fn ensure_audit_tables(pool: &PgPool, schema: &str) -> Result<(), RuntimeError> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema))
        .execute(pool)
        .await?;
    for table in ["history_logs", "trash_logs"] {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}"."{}" (
                id BIGSERIAL PRIMARY KEY,
                entity TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                data JSONB NOT NULL,
                previous_data JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expire_at TIMESTAMPTZ NOT NULL
            )
            "#,
            schema, table
        );
        sqlx::query(&ddl).execute(pool).await?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"{}_entity_idx\" ON \"{}\".\"{}\" (entity, entity_id)",
            table, schema, table
        );
        sqlx::query(&index).execute(pool).await?;
    }
    Ok(())
}

/// Writes audit entries on a spawned task, outside any caller transaction.
#[derive(Clone)]
pub struct SqlAuditSink {
    pool: PgPool,
    schema: String,
}

impl SqlAuditSink {
    pub fn new(pool: PgPool, schema: &str) -> Self {
        SqlAuditSink {
            pool,
            schema: schema.to_string(),
        }
    }
}

impl AuditSink for SqlAuditSink {
    fn record(&self, entry: AuditEntry) {
        let pool = self.pool.clone();
        let sql = format!(
            "INSERT INTO \"{}\".\"{}\" (entity, entity_id, action, data, previous_data, expire_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.schema,
            entry.kind.target()
        );
        tokio::spawn(async move {
            let res = sqlx::query(&sql)
                .bind(&entry.entity)
                .bind(entry.entity_id_text())
                .bind(&entry.action)
                .bind(&entry.data)
                .bind(&entry.previous_data)
                .bind(entry.expire_at)
                .execute(&pool)
                .await;
            if let Err(e) = res {
                tracing::warn!(entity = %entry.entity, kind = ?entry.kind, error = %e, "audit write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Association;
    use crate::job::Job;
    use crate::persistence::{AuditKind, MemoryAuditSink};
    use crate::service::RecordService;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        replies: Mutex<VecDeque<Vec<Value>>>,
        seen: Mutex<Vec<(String, Option<PgTransaction>)>>,
    }

    impl Recording {
        fn reply(&self, rows: Value) {
            let rows = match rows {
                Value::Array(rows) => rows,
                other => vec![other],
            };
            self.replies.lock().unwrap().push_back(rows);
        }

        fn transactions(&self) -> Vec<Option<PgTransaction>> {
            self.seen.lock().unwrap().iter().map(|(_, tx)| tx.clone()).collect()
        }
    }

    #[async_trait]
    impl SqlExecutor for Recording {
        async fn fetch_all(&self, q: &QueryBuf, tx: Option<&PgTransaction>) -> Result<Vec<Value>, RuntimeError> {
            self.seen.lock().unwrap().push((q.sql.clone(), tx.cloned()));
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn service() -> (RecordService<Relational, RelationalRepository<Arc<Recording>>>, Arc<Recording>, Arc<MemoryAuditSink>) {
        let users = EntityDescriptor::new("users")
            .with_history(true)
            .with_association(Association::to_many("posts", "posts", "id", "user_id"));
        let posts = EntityDescriptor::new("posts");
        let model = Arc::new(ResolvedModel::from_entities(vec![users.clone(), posts]));
        let exec = Arc::new(Recording::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let repo = RelationalRepository::new(SqlBackend::new(exec.clone(), model), users).with_audit(audit.clone());
        (RecordService::new(repo), exec, audit)
    }

    fn in_tx(tx: &PgTransaction) -> QueryOptions<Relational> {
        QueryOptions {
            transaction: Some(tx.clone()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn transaction_reaches_lookup_and_write() {
        let (service, exec, audit) = service();
        let tx = PgTransaction::closed();
        exec.reply(json!({ "id": 4, "name": "Old" }));
        exec.reply(json!({ "id": 4, "name": "New" }));

        service
            .update(Job::new("rename").with_id(4).with_body(json!({ "name": "New" })).with_options(in_tx(&tx)))
            .await
            .unwrap();

        assert_eq!(exec.transactions(), vec![Some(tx.clone()), Some(tx)]);
        assert_eq!(audit.count(AuditKind::History), 1);
    }

    #[tokio::test]
    async fn transaction_reaches_separate_includes_and_count() {
        let (service, exec, _) = service();
        let tx = PgTransaction::closed();
        exec.reply(json!([{ "id": 1 }]));
        exec.reply(json!([{ "id": 10, "user_id": 1 }]));
        exec.reply(json!({ "count": 1 }));

        let listed = service
            .find_all(
                Job::new("list")
                    .with_payload(serde_json::from_value(json!({ "populate": "-posts" })).unwrap())
                    .with_options(in_tx(&tx)),
            )
            .await
            .unwrap();
        assert_eq!(listed.count, Some(1));

        let seen = exec.transactions();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|t| t.as_ref() == Some(&tx)));
    }

    #[tokio::test]
    async fn without_a_transaction_statements_use_the_pool() {
        let (service, exec, _) = service();
        exec.reply(json!([{ "id": 1, "name": "Ada" }]));
        service.find_by_id(Job::new("show").with_id(1)).await.unwrap();
        assert_eq!(exec.transactions(), vec![None]);
    }
}
