//! The document engine seen as an opaque set of collection operations.

use crate::error::RuntimeError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Map<String, Value>>,
    pub skip: u64,
    pub limit: Option<u64>,
    /// Fields to keep; `_id` is always kept.
    pub projection: Option<Vec<String>>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, filter: &Value, options: &FindOptions) -> Result<Vec<Value>, RuntimeError>;

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, RuntimeError>;

    /// Inserts and returns the stored documents (with generated `_id` where missing).
    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>, RuntimeError>;

    /// Applies `update` to every match and returns the updated documents.
    async fn update_many(&self, collection: &str, filter: &Value, update: &Value) -> Result<Vec<Value>, RuntimeError>;

    /// Removes every match and returns what was removed.
    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, RuntimeError>;

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>, RuntimeError>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    async fn find(&self, collection: &str, filter: &Value, options: &FindOptions) -> Result<Vec<Value>, RuntimeError> {
        (**self).find(collection, filter, options).await
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, RuntimeError> {
        (**self).count(collection, filter).await
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        (**self).insert_many(collection, docs).await
    }

    async fn update_many(&self, collection: &str, filter: &Value, update: &Value) -> Result<Vec<Value>, RuntimeError> {
        (**self).update_many(collection, filter, update).await
    }

    async fn delete_many(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, RuntimeError> {
        (**self).delete_many(collection, filter).await
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        (**self).aggregate(collection, pipeline).await
    }
}
