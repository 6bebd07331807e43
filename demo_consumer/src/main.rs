//! Demo consumer: drives the record service against the in-memory document store and,
//! when `DATABASE_URL` is set, against PostgreSQL.
//!
//! Run from repo root: `cargo run -p demo-consumer`

use record_sdk::{
    ensure_audit_tables, envelope, resolve, DocumentBackend, DocumentRepository, EntityConfig, Job, JobResponse,
    MemoryAuditSink, MemoryDocumentStore, Owner, Payload, PgExecutor, RecordService, RelationalRepository,
    ResolvedModel, Settings, SqlAuditSink, SqlBackend,
};
use serde_json::json;
use std::sync::Arc;

fn print(step: &str, res: &JobResponse) {
    println!("{:<16} {}", step, envelope(res));
}

fn payload(value: serde_json::Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value(value)
}

async fn load_model() -> Result<ResolvedModel, Box<dyn std::error::Error>> {
    let configs: Vec<EntityConfig> = match std::env::var("RECORD_ENTITIES_PATH") {
        Ok(path) => record_sdk::load_from_path(path).await?,
        Err(_) => serde_json::from_value(json!([
            { "name": "authors", "search_fields": ["name"], "history": true, "trash": true },
            {
                "name": "posts",
                "search_fields": ["title"],
                "associations": [{
                    "name": "author", "target": "authors", "direction": "to_one",
                    "local_key": "author_id", "foreign_key": "id"
                }]
            }
        ]))?,
    };
    Ok(resolve(&configs)?)
}

async fn document_scenario(model: Arc<ResolvedModel>, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryDocumentStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let authors = model.entity("authors").ok_or("authors entity missing")?.clone();
    let repo: DocumentRepository<Arc<MemoryDocumentStore>> =
        DocumentRepository::new(DocumentBackend::new(store.clone(), model.clone()), authors)
            .with_audit(audit.clone())
            .with_settings(settings.clone());
    let service = RecordService::new(repo).with_settings(settings);
    let owner = Owner::new("demo");

    let created = service
        .create(Job::new("signup").with_owner(owner.clone()).with_body(json!({ "name": "Ada" })))
        .await;
    print("create", &created);
    let id = created?.data.and_then(|d| d.get("_id").cloned()).ok_or("created record has no _id")?;

    let res = service
        .update(Job::new("rename").with_owner(owner.clone()).with_id(id.clone()).with_body(json!({ "name": "Ada L." })))
        .await;
    print("update", &res);

    let res = service
        .find_all(Job::new("list").with_payload(payload(json!({ "search": "ada", "sort": "-name" }))?))
        .await;
    print("find_all", &res);

    print("delete", &service.delete(Job::new("remove").with_owner(owner.clone()).with_id(id.clone())).await);
    print("find_by_id", &service.find_by_id(Job::new("show").with_id(id.clone())).await);
    print("restore", &service.restore(Job::new("undo").with_owner(owner).with_id(id.clone())).await);
    print("find_by_id", &service.find_by_id(Job::new("show").with_id(id)).await);

    tracing::info!(history = audit.entries().len(), "document scenario done");
    Ok(())
}

async fn relational_scenario(
    database_url: &str,
    model: Arc<ResolvedModel>,
    settings: Settings,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    ensure_audit_tables(&pool, &settings.audit_schema).await?;
    let authors = model.entity("authors").ok_or("authors entity missing")?.clone();
    let repo: RelationalRepository<PgExecutor> =
        RelationalRepository::new(SqlBackend::new(PgExecutor::new(pool.clone()), model.clone()), authors)
            .with_audit(Arc::new(SqlAuditSink::new(pool, &settings.audit_schema)))
            .with_settings(settings.clone());
    let service = RecordService::new(repo).with_settings(settings);

    let res = service
        .find_all(Job::new("list").with_payload(payload(json!({ "limit": 5, "sort": "name" }))?))
        .await;
    print("sql find_all", &res);
    print("sql get_count", &service.get_count(Job::new("count")).await);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("record_sdk=debug,demo_consumer=info")),
        )
        .init();

    let settings = Settings::from_env();
    let model = Arc::new(load_model().await?);

    document_scenario(model.clone(), settings.clone()).await?;

    match std::env::var("DATABASE_URL") {
        Ok(url) => relational_scenario(&url, model, settings).await?,
        Err(_) => tracing::info!("DATABASE_URL not set, skipping the PostgreSQL scenario"),
    }
    Ok(())
}
