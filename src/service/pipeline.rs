//! The driver: compile the payload, run hooks around persistence, return one envelope.

use crate::config::Settings;
use crate::job::{IntoJob, Job, JobResponse};
use crate::persistence::Persistence;
use crate::query::{
    compile_delete_options, compile_read_options, compile_write_options, CompileContext, Dialect,
};
use crate::error::RuntimeError;
use crate::service::hooks::{LifecycleHooks, NoHooks};
use std::marker::PhantomData;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompileKind {
    Read,
    Write,
    Delete,
}

/// Operations that pass straight through to persistence with no hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DirectOp {
    CreateBulk,
    UpdateBulk,
    FindAndUpdate,
    FindAndDelete,
    DeleteBulk,
    Restore,
    FindOrCreate,
    CreateOrUpdate,
    Aggregate,
}

impl DirectOp {
    fn name(self) -> &'static str {
        match self {
            DirectOp::CreateBulk => "create_bulk",
            DirectOp::UpdateBulk => "update_bulk",
            DirectOp::FindAndUpdate => "find_and_update",
            DirectOp::FindAndDelete => "find_and_delete",
            DirectOp::DeleteBulk => "delete_bulk",
            DirectOp::Restore => "restore",
            DirectOp::FindOrCreate => "find_or_create",
            DirectOp::CreateOrUpdate => "create_or_update",
            DirectOp::Aggregate => "aggregate",
        }
    }

    fn compile_kind(self) -> CompileKind {
        match self {
            DirectOp::Aggregate => CompileKind::Read,
            DirectOp::FindAndDelete | DirectOp::DeleteBulk | DirectOp::Restore => CompileKind::Delete,
            _ => CompileKind::Write,
        }
    }
}

/// Hooked CRUD service for one entity.
pub struct RecordService<D: Dialect, P: Persistence<D>, H: LifecycleHooks<D> = NoHooks> {
    persistence: P,
    hooks: H,
    settings: Settings,
    _dialect: PhantomData<fn() -> D>,
}

impl<D: Dialect, P: Persistence<D>> RecordService<D, P, NoHooks> {
    pub fn new(persistence: P) -> Self {
        RecordService {
            persistence,
            hooks: NoHooks,
            settings: Settings::default(),
            _dialect: PhantomData,
        }
    }
}

impl<D: Dialect, P: Persistence<D>, H: LifecycleHooks<D>> RecordService<D, P, H> {
    pub fn with_hooks<H2: LifecycleHooks<D>>(self, hooks: H2) -> RecordService<D, P, H2> {
        RecordService {
            persistence: self.persistence,
            hooks,
            settings: self.settings,
            _dialect: PhantomData,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Normalize and compile. Hand-set options win over compiled ones.
    fn prepare(&self, job: impl IntoJob<D>, kind: CompileKind) -> Result<Job<D>, RuntimeError> {
        let mut job = job.into_job()?;
        let ctx = CompileContext {
            search_fields: &self.persistence.entity().search_fields,
            default_limit: self.settings.default_limit,
        };
        let existing = std::mem::take(&mut job.options);
        job.options = match kind {
            CompileKind::Read => compile_read_options(&job.payload, existing, &ctx),
            CompileKind::Write => compile_write_options(&job.payload, existing, &ctx),
            CompileKind::Delete => compile_delete_options(&job.payload, existing, &ctx),
        };
        Ok(job)
    }

    fn finish(&self, op: &str, res: JobResponse) -> JobResponse {
        if let Err(e) = &res {
            tracing::debug!(
                entity = %self.persistence.entity().name,
                op,
                code = e.code(),
                error = %e,
                "operation failed"
            );
        }
        res
    }

    pub async fn find_all(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Read)?;
            self.hooks.do_before_read(&mut job).await?;
            self.hooks.do_before_find_all(&mut job).await?;
            let mut data = self.persistence.find_all(&job).await?;
            self.hooks.do_after_find_all(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("find_all", res)
    }

    pub async fn get_count(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Read)?;
            self.hooks.do_before_read(&mut job).await?;
            self.hooks.do_before_get_count(&mut job).await?;
            let mut data = self.persistence.get_count(&job).await?;
            self.hooks.do_after_get_count(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("get_count", res)
    }

    pub async fn find_by_id(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Read)?;
            self.hooks.do_before_read(&mut job).await?;
            self.hooks.do_before_find_by_id(&mut job).await?;
            let mut data = self.persistence.find_by_id(&job).await?;
            self.hooks.do_after_find_by_id(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("find_by_id", res)
    }

    pub async fn find_one(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Read)?;
            self.hooks.do_before_read(&mut job).await?;
            self.hooks.do_before_find_one(&mut job).await?;
            let mut data = self.persistence.find_one(&job).await?;
            self.hooks.do_after_find_one(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("find_one", res)
    }

    pub async fn create(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Write)?;
            self.hooks.do_before_write(&mut job).await?;
            self.hooks.do_before_create(&mut job).await?;
            let mut data = self.persistence.create(&job).await?;
            self.hooks.do_after_write(&mut job, &mut data).await?;
            self.hooks.do_after_create(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("create", res)
    }

    pub async fn update(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Write)?;
            self.hooks.do_before_write(&mut job).await?;
            self.hooks.do_before_update(&mut job).await?;
            let mut data = self.persistence.update(&job).await?;
            self.hooks.do_after_write(&mut job, &mut data).await?;
            self.hooks.do_after_update(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("update", res)
    }

    pub async fn delete(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let mut job = self.prepare(job, CompileKind::Delete)?;
            self.hooks.do_before_delete(&mut job).await?;
            let mut data = self.persistence.delete(&job).await?;
            self.hooks.do_after_delete(&mut job, &mut data).await?;
            Ok::<_, RuntimeError>(data)
        }
        .await;
        self.finish("delete", res)
    }

    async fn direct(&self, op: DirectOp, job: impl IntoJob<D> + Send) -> JobResponse {
        let res = async {
            let job = self.prepare(job, op.compile_kind())?;
            let p = &self.persistence;
            match op {
                DirectOp::CreateBulk => p.create_bulk(&job).await,
                DirectOp::UpdateBulk => p.update_bulk(&job).await,
                DirectOp::FindAndUpdate => p.find_and_update(&job).await,
                DirectOp::FindAndDelete => p.find_and_delete(&job).await,
                DirectOp::DeleteBulk => p.delete_bulk(&job).await,
                DirectOp::Restore => p.restore(&job).await,
                DirectOp::FindOrCreate => p.find_or_create(&job).await,
                DirectOp::CreateOrUpdate => p.create_or_update(&job).await,
                DirectOp::Aggregate => p.aggregate(&job).await,
            }
        }
        .await;
        self.finish(op.name(), res)
    }

    pub async fn create_bulk(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::CreateBulk, job).await
    }

    pub async fn update_bulk(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::UpdateBulk, job).await
    }

    pub async fn find_and_update(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::FindAndUpdate, job).await
    }

    pub async fn find_and_delete(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::FindAndDelete, job).await
    }

    pub async fn delete_bulk(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::DeleteBulk, job).await
    }

    pub async fn restore(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::Restore, job).await
    }

    pub async fn find_or_create(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::FindOrCreate, job).await
    }

    pub async fn create_or_update(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::CreateOrUpdate, job).await
    }

    pub async fn aggregate(&self, job: impl IntoJob<D> + Send) -> JobResponse {
        self.direct(DirectOp::Aggregate, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntityDescriptor;
    use crate::document::{Document, DocumentBackend, DocumentRepository, MemoryDocumentStore};
    use crate::config::ResolvedModel;
    use crate::job::{JobData, Payload};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn repo() -> DocumentRepository<Arc<MemoryDocumentStore>> {
        let users = EntityDescriptor::new("users").with_search_fields(&["name"]);
        let model = Arc::new(ResolvedModel::from_entities(vec![users.clone()]));
        DocumentRepository::new(DocumentBackend::new(Arc::new(MemoryDocumentStore::new()), model), users)
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        fail_before_create: bool,
    }

    impl Recorder {
        fn push(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }
    }

    #[async_trait]
    impl LifecycleHooks<Document> for Arc<Recorder> {
        async fn do_before_read(&self, _job: &mut Job<Document>) -> Result<(), RuntimeError> {
            self.push("before_read");
            Ok(())
        }

        async fn do_before_find_all(&self, job: &mut Job<Document>) -> Result<(), RuntimeError> {
            self.push("before_find_all");
            // scope every listing to active users
            job.options.filter = Some(Document::conjoin(
                job.options.filter.take().unwrap_or(json!({})),
                json!({ "active": true }),
            ));
            Ok(())
        }

        async fn do_after_find_all(&self, _job: &mut Job<Document>, data: &mut JobData) -> Result<(), RuntimeError> {
            self.push("after_find_all");
            data.limit = Some(99);
            Ok(())
        }

        async fn do_before_write(&self, _job: &mut Job<Document>) -> Result<(), RuntimeError> {
            self.push("before_write");
            Ok(())
        }

        async fn do_before_create(&self, job: &mut Job<Document>) -> Result<(), RuntimeError> {
            self.push("before_create");
            if self.fail_before_create {
                return Err(RuntimeError::Hook("creation disabled".into()));
            }
            job.body.insert("source".into(), json!("hook"));
            Ok(())
        }

        async fn do_after_write(&self, _job: &mut Job<Document>, _data: &mut JobData) -> Result<(), RuntimeError> {
            self.push("after_write");
            Ok(())
        }

        async fn do_after_create(&self, _job: &mut Job<Document>, _data: &mut JobData) -> Result<(), RuntimeError> {
            self.push("after_create");
            Ok(())
        }

        async fn do_before_delete(&self, _job: &mut Job<Document>) -> Result<(), RuntimeError> {
            self.push("before_delete");
            Ok(())
        }

        async fn do_after_delete(&self, _job: &mut Job<Document>, _data: &mut JobData) -> Result<(), RuntimeError> {
            self.push("after_delete");
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_hooks_run_in_order_and_may_edit_the_job() {
        let recorder = Arc::new(Recorder::default());
        let service = RecordService::new(repo()).with_hooks(recorder.clone());
        let created = service
            .create(Job::new("signup").with_body(json!({ "name": "Ann" })))
            .await
            .unwrap();
        assert_eq!(created.created, Some(true));
        assert_eq!(created.data.unwrap()["source"], json!("hook"));
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["before_write", "before_create", "after_write", "after_create"]
        );
    }

    #[tokio::test]
    async fn hook_error_becomes_the_response() {
        let recorder = Arc::new(Recorder {
            fail_before_create: true,
            ..Default::default()
        });
        let service = RecordService::new(repo()).with_hooks(recorder.clone());
        let err = service
            .create(Job::new("signup").with_body(json!({ "name": "Ann" })))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "hook_error");
        assert!(!recorder.calls.lock().unwrap().contains(&"after_create"));
    }

    #[tokio::test]
    async fn persistence_error_skips_after_hooks() {
        let recorder = Arc::new(Recorder::default());
        let service = RecordService::new(repo()).with_hooks(recorder.clone());
        let err = service.delete(Job::new("remove").with_id("missing")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["before_delete"]);
    }

    #[tokio::test]
    async fn read_hooks_see_compiled_options() {
        let recorder = Arc::new(Recorder::default());
        let service = RecordService::new(repo()).with_hooks(recorder.clone());
        service.create(Job::new("seed").with_body(json!({ "name": "Ann" }))).await.unwrap();
        service
            .create(Job::new("seed").with_body(json!({ "name": "Bob", "active": false })))
            .await
            .unwrap();

        let payload: Payload = serde_json::from_value(json!({ "search": "b" })).unwrap();
        let listed = service
            .find_all(Job::new("list").with_payload(payload))
            .await
            .unwrap();
        // "Bob" matches the search but is inactive
        assert_eq!(listed.data, Some(Value::Array(vec![])));
        assert_eq!(listed.limit, Some(99));
        assert!(recorder.calls.lock().unwrap().ends_with(&["before_read", "before_find_all", "after_find_all"]));
    }

    #[tokio::test]
    async fn plain_objects_are_accepted_as_jobs() {
        let service = RecordService::new(repo());
        let created = service
            .create(json!({ "action": "seed", "body": { "name": "Ann" } }))
            .await
            .unwrap();
        let id = created.data.unwrap()["_id"].clone();
        let found = service.find_by_id(json!({ "id": id })).await.unwrap();
        assert_eq!(found.data.unwrap()["name"], json!("Ann"));

        let err = service.find_by_id(json!({ "id": 5, "body": 3 })).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
