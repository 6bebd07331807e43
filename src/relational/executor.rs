//! Opaque SQL execution: the storage engine seen as "run this statement, give me JSON rows".

use crate::error::RuntimeError;
use crate::relational::builder::QueryBuf;
use crate::relational::params::PgBindValue;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Postgres, Row, TypeInfo};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Caller-owned transaction shared through `options.transaction`. The runtime only runs
/// statements on it; beginning, committing and rolling back stay with the caller.
#[derive(Clone)]
pub struct PgTransaction(Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>);

impl PgTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        PgTransaction(Arc::new(Mutex::new(Some(tx))))
    }

    /// A handle with no open transaction behind it. Statements run on it fail.
    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        PgTransaction(Arc::new(Mutex::new(None)))
    }

    /// Take the transaction back for commit/rollback. Fails while clones are still alive.
    pub fn into_inner(self) -> Result<sqlx::Transaction<'static, Postgres>, RuntimeError> {
        Arc::try_unwrap(self.0)
            .map_err(|_| RuntimeError::Validation("transaction still shared by an in-flight job".into()))?
            .into_inner()
            .ok_or_else(|| RuntimeError::Validation("transaction is no longer open".into()))
    }
}

impl std::fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PgTransaction").field(&Arc::as_ptr(&self.0)).finish()
    }
}

impl PartialEq for PgTransaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn fetch_all(&self, q: &QueryBuf, tx: Option<&PgTransaction>) -> Result<Vec<Value>, RuntimeError>;

    async fn fetch_optional(&self, q: &QueryBuf, tx: Option<&PgTransaction>) -> Result<Option<Value>, RuntimeError> {
        Ok(self.fetch_all(q, tx).await?.into_iter().next())
    }
}

#[async_trait]
impl<E: SqlExecutor + ?Sized> SqlExecutor for Arc<E> {
    async fn fetch_all(&self, q: &QueryBuf, tx: Option<&PgTransaction>) -> Result<Vec<Value>, RuntimeError> {
        (**self).fetch_all(q, tx).await
    }
}

/// Executes on a PostgreSQL pool, or on the caller's transaction when one is supplied.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        PgExecutor { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn fetch_all(&self, q: &QueryBuf, tx: Option<&PgTransaction>) -> Result<Vec<Value>, RuntimeError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, in_tx = tx.is_some(), "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        let rows = match tx {
            Some(tx) => {
                let mut guard = tx.0.lock().await;
                let conn = guard
                    .as_mut()
                    .ok_or_else(|| RuntimeError::Validation("transaction is no longer open".into()))?;
                query.fetch_all(&mut **conn).await?
            }
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows.iter().map(row_to_json).collect())
    }
}

pub(crate) fn row_to_json(row: &PgRow) -> Value {
    let mut map = serde_json::Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        map.insert(col.name().to_string(), cell_to_value(row, idx, col.type_info().name()));
    }
    Value::Object(map)
}

fn cell_to_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        row.try_get::<Option<T>, _>(idx).ok().flatten()
    }

    let value = match type_name {
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).map(|n| Value::from(n as f64)),
        "FLOAT8" => get::<f64>(row, idx).map(Value::from),
        "BOOL" => get::<bool>(row, idx).map(Value::Bool),
        "UUID" => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, idx).map(|d| Value::String(d.to_rfc3339())),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, idx)
            .map(|d| Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "DATE" => get::<chrono::NaiveDate>(row, idx).map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}
