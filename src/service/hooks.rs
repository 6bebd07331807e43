//! Lifecycle hooks: before/after extension points around the canonical operations.

use crate::error::RuntimeError;
use crate::job::{Job, JobData};
use crate::query::Dialect;
use async_trait::async_trait;

/// Every method is a no-op by default. Before hooks may rewrite the job; after hooks may
/// rewrite the successful response. Returning an error aborts the operation.
#[async_trait]
pub trait LifecycleHooks<D: Dialect>: Send + Sync {
    /// Runs before every read (find_all, get_count, find_by_id, find_one).
    async fn do_before_read(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_find_all(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_find_all(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_get_count(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_get_count(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_find_by_id(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_find_by_id(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_find_one(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_find_one(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Runs before create and update.
    async fn do_before_write(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_create(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_update(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Runs after a successful create or update, before the specific after hook.
    async fn do_after_write(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_create(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_update(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_before_delete(&self, _job: &mut Job<D>) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn do_after_delete(&self, _job: &mut Job<D>, _data: &mut JobData) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl<D: Dialect> LifecycleHooks<D> for NoHooks {}
