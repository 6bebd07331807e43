//! End-to-end flows over the in-memory document store.

use record_sdk::persistence::AuditKind;
use record_sdk::{
    envelope, Document, DocumentAuditSink, DocumentBackend, DocumentRepository, EntityDescriptor, Job, MemoryAuditSink,
    MemoryDocumentStore, Owner, Payload, RecordService, ResolvedModel,
};
use record_sdk::config::Association;
use serde_json::{json, Value};
use std::sync::Arc;

type Service = RecordService<Document, DocumentRepository<Arc<MemoryDocumentStore>>>;

struct Fixture {
    store: Arc<MemoryDocumentStore>,
    audit: Arc<MemoryAuditSink>,
    model: Arc<ResolvedModel>,
}

impl Fixture {
    fn new() -> Self {
        let authors = EntityDescriptor::new("authors")
            .with_search_fields(&["name"])
            .with_history(true)
            .with_trash(true)
            .with_association(Association::to_many("posts", "posts", "_id", "author_id"));
        let posts = EntityDescriptor::new("posts")
            .with_association(Association::to_one("author", "authors", "author_id", "_id"));
        Fixture {
            store: Arc::new(MemoryDocumentStore::new()),
            audit: Arc::new(MemoryAuditSink::new()),
            model: Arc::new(ResolvedModel::from_entities(vec![authors, posts])),
        }
    }

    fn service(&self, entity: &str) -> Service {
        let descriptor = self.model.entity(entity).unwrap().clone();
        let repo = DocumentRepository::new(DocumentBackend::new(self.store.clone(), self.model.clone()), descriptor)
            .with_audit(self.audit.clone());
        RecordService::new(repo)
    }
}

fn payload(value: Value) -> Payload {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn soft_delete_hides_until_restored() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let owner = Owner::new("u1");

    let created = authors
        .create(Job::new("signup").with_owner(owner.clone()).with_body(json!({ "name": "Ada" })))
        .await
        .unwrap();
    let doc = created.data.unwrap();
    let id = doc["_id"].clone();
    assert_eq!(doc["created_by"], json!("u1"));
    assert_eq!(doc["active"], json!(true));
    assert_eq!(doc["deleted"], json!(false));

    let updated = authors
        .update(Job::new("rename").with_owner(owner.clone()).with_id(id.clone()).with_body(json!({ "name": "Ada L." })))
        .await
        .unwrap();
    assert_eq!(updated.data.unwrap()["name"], json!("Ada L."));
    assert_eq!(updated.previous_data.unwrap()["name"], json!("Ada"));

    let deleted = authors
        .delete(Job::new("remove").with_owner(owner.clone()).with_id(id.clone()))
        .await
        .unwrap();
    let deleted = deleted.data.unwrap();
    assert_eq!(deleted["deleted"], json!(true));
    assert_eq!(deleted["deleted_by"], json!("u1"));

    let err = authors.find_by_id(Job::new("show").with_id(id.clone())).await.unwrap_err();
    assert!(err.is_not_found());

    let listed = authors.find_all(Job::new("list")).await.unwrap();
    assert_eq!(listed.data, Some(json!([])));
    assert_eq!(listed.count, Some(0));

    let trashed = authors
        .find_all(Job::new("trash").with_payload(payload(json!({ "onlyDeleted": true }))))
        .await
        .unwrap();
    assert_eq!(trashed.count, Some(1));

    let seen = authors
        .find_by_id(Job::new("audit").with_id(id.clone()).with_payload(payload(json!({ "withDeleted": true }))))
        .await
        .unwrap();
    assert_eq!(seen.data.unwrap()["name"], json!("Ada L."));

    let restored = authors
        .restore(Job::new("undo").with_owner(owner).with_id(id.clone()))
        .await
        .unwrap();
    assert_eq!(restored.data.unwrap()["deleted"], json!(false));

    let found = authors.find_by_id(Job::new("show").with_id(id)).await.unwrap();
    assert_eq!(found.data.unwrap()["name"], json!("Ada L."));

    assert_eq!(fx.audit.count(AuditKind::History), 2);
    assert_eq!(fx.audit.count(AuditKind::Trash), 0);
}

#[tokio::test]
async fn hard_delete_removes_and_archives() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let id = authors
        .create(Job::new("seed").with_body(json!({ "name": "Grace" })))
        .await
        .unwrap()
        .data
        .unwrap()["_id"]
        .clone();

    let removed = authors
        .delete(Job::new("purge").with_id(id.clone()).with_payload(payload(json!({ "mode": "hard" }))))
        .await
        .unwrap();
    assert_eq!(removed.data.unwrap()["name"], json!("Grace"));
    assert!(fx.store.dump("authors").await.is_empty());
    assert_eq!(fx.audit.count(AuditKind::Trash), 1);

    let err = authors
        .restore(Job::new("undo").with_id(id))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn restore_of_a_live_record_is_not_found() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let id = authors
        .create(Job::new("seed").with_body(json!({ "name": "Live" })))
        .await
        .unwrap()
        .data
        .unwrap()["_id"]
        .clone();
    assert!(authors.restore(Job::new("undo").with_id(id)).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn listing_searches_sorts_and_windows() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let records: Vec<Value> = ["Ann", "Bea", "Anna", "Bob", "Annie"]
        .iter()
        .map(|n| json!({ "name": n }))
        .collect();
    let bulk = authors.create_bulk(Job::new("seed").with_records(records)).await.unwrap();
    assert_eq!(bulk.data.unwrap().as_array().unwrap().len(), 5);

    let page = authors
        .find_all(Job::new("list").with_payload(payload(json!({
            "search": "ANN", "sort": "-name", "offset": 1, "limit": 1, "select": "name"
        }))))
        .await
        .unwrap();
    let rows = page.data.unwrap();
    assert_eq!(rows, json!([{ "_id": rows[0]["_id"].clone(), "name": "Anna" }]));
    assert_eq!((page.count, page.offset, page.limit), (Some(3), Some(1), Some(1)));

    let plain = authors
        .find_all(Job::new("list").with_payload(payload(json!({ "pagination": false, "where": { "name": "Bob" } }))))
        .await
        .unwrap();
    assert_eq!(plain.count, None);
    assert_eq!(plain.data.unwrap().as_array().unwrap().len(), 1);

    let count = authors.get_count(Job::new("count")).await.unwrap();
    assert_eq!(envelope(&Ok(count)), json!({ "count": 5 }));
}

#[tokio::test]
async fn population_attaches_related_records() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let posts = fx.service("posts");
    let ada = authors
        .create(Job::new("seed").with_body(json!({ "_id": "a1", "name": "Ada" })))
        .await
        .unwrap();
    assert_eq!(ada.data.unwrap()["_id"], json!("a1"));
    posts
        .create_bulk(Job::new("seed").with_records(vec![
            json!({ "_id": "p1", "title": "Engines", "author_id": "a1" }),
            json!({ "_id": "p2", "title": "Notes", "author_id": "a1" }),
            json!({ "_id": "p3", "title": "Orphan", "author_id": "zz" }),
        ]))
        .await
        .unwrap();

    let post = posts
        .find_by_id(Job::new("show").with_id("p1").with_payload(payload(json!({ "populate": "author" }))))
        .await
        .unwrap();
    assert_eq!(post.data.unwrap()["author"]["name"], json!("Ada"));

    let orphan = posts
        .find_by_id(Job::new("show").with_id("p3").with_payload(payload(json!({ "populate": "author" }))))
        .await
        .unwrap();
    assert_eq!(orphan.data.unwrap()["author"], Value::Null);

    let author = authors
        .find_by_id(Job::new("show").with_id("a1").with_payload(payload(json!({ "populate": "posts" }))))
        .await
        .unwrap();
    let titles: Vec<Value> = author.data.unwrap()["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["title"].clone())
        .collect();
    assert_eq!(titles, vec![json!("Engines"), json!("Notes")]);
}

#[tokio::test]
async fn required_population_filters_before_windowing() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let posts = fx.service("posts");
    authors
        .create(Job::new("seed").with_body(json!({ "_id": "a1", "name": "Ada" })))
        .await
        .unwrap();
    posts
        .create_bulk(Job::new("seed").with_records(vec![
            json!({ "_id": "p1", "title": "Lost", "author_id": "zz" }),
            json!({ "_id": "p2", "title": "Stray", "author_id": null }),
            json!({ "_id": "p3", "title": "Engines", "author_id": "a1" }),
        ]))
        .await
        .unwrap();

    let page = posts
        .find_all(Job::new("list").with_payload(payload(json!({ "populate": "author*", "limit": 2 }))))
        .await
        .unwrap();
    let rows = page.data.unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], json!("p3"));
    assert_eq!(rows[0]["author"]["name"], json!("Ada"));
    assert_eq!(page.count, Some(1));

    let counted = posts
        .get_count(Job::new("count").with_payload(payload(json!({ "populate": "author*" }))))
        .await
        .unwrap();
    assert_eq!(counted.count, Some(1));

    authors
        .delete(Job::new("remove").with_id("a1"))
        .await
        .unwrap();
    let page = posts
        .find_all(Job::new("list").with_payload(payload(json!({ "populate": "author*" }))))
        .await
        .unwrap();
    assert_eq!(page.data, Some(json!([])));
    assert_eq!(page.count, Some(0));
}

#[tokio::test]
async fn operator_shaped_ids_never_reach_storage() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    authors
        .create_bulk(Job::new("seed").with_records(vec![
            json!({ "name": "Ada" }),
            json!({ "name": "Grace" }),
            json!({ "name": "Edsger" }),
        ]))
        .await
        .unwrap();

    let err = authors
        .delete(Job::new("remove").with_id(json!({ "$ne": null })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert_eq!(err.to_string(), "id must be a scalar value");

    let err = authors
        .update(Job::new("rename").with_id(json!(["a", "b"])).with_body(json!({ "name": "x" })))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let err = authors
        .delete_bulk(Job::new("prune").with_records(vec![json!({ "_id": { "$exists": true } })]))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "records[0] must be a scalar value");

    let listed = authors.find_all(Job::new("list")).await.unwrap();
    assert_eq!(listed.count, Some(3));
    assert_eq!(fx.audit.count(AuditKind::History), 0);
}

#[tokio::test]
async fn combined_operations_report_created() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let job = || {
        Job::new("upsert")
            .with_body(json!({ "country": "UK" }))
            .with_payload(payload(json!({ "where": { "name": "Ada" } })))
    };

    let first = authors.find_or_create(job()).await.unwrap();
    assert_eq!(first.created, Some(true));
    let row = first.data.unwrap();
    assert_eq!((row["name"].clone(), row["country"].clone()), (json!("Ada"), json!("UK")));

    let second = authors.find_or_create(job()).await.unwrap();
    assert_eq!(second.created, Some(false));
    assert_eq!(second.data.unwrap()["_id"], row["_id"]);

    let upserted = authors
        .create_or_update(
            Job::new("upsert")
                .with_body(json!({ "country": "FR" }))
                .with_payload(payload(json!({ "where": { "name": "Ada" } }))),
        )
        .await
        .unwrap();
    assert_eq!(upserted.created, Some(false));
    assert_eq!(upserted.data.unwrap()["country"], json!("FR"));

    let missing = authors
        .find_and_update(
            Job::new("edit")
                .with_body(json!({ "country": "DE" }))
                .with_payload(payload(json!({ "where": { "name": "Nobody" }, "allowEmpty": true }))),
        )
        .await
        .unwrap();
    assert_eq!(missing.data, Some(Value::Null));
}

#[tokio::test]
async fn guards_reject_before_touching_storage() {
    let fx = Fixture::new();
    let authors = fx.service("authors");

    let err = authors.create(Job::new("x")).await.unwrap_err();
    assert_eq!(err.to_string(), "body is required");
    let err = authors.update(Job::new("x").with_body(json!({ "a": 1 }))).await.unwrap_err();
    assert_eq!(err.to_string(), "id is required");
    let err = authors.find_one(Job::new("x")).await.unwrap_err();
    assert_eq!(err.to_string(), "options.where is required");
    let err = authors
        .find_and_delete(Job::new("x").with_payload(payload(json!({ "where": "garbage" }))))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "options.where is required");
    let err = authors.delete_bulk(Job::new("x")).await.unwrap_err();
    assert_eq!(err.to_string(), "options.where or records is required");
    let err = authors.aggregate(Job::new("x")).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let too_many: Vec<Value> = (0..101).map(|i| json!({ "n": i })).collect();
    let err = authors.create_bulk(Job::new("x").with_records(too_many)).await.unwrap_err();
    assert_eq!(err.to_string(), "at most 100 records per bulk write, got 101");

    assert!(fx.store.dump("authors").await.is_empty());
}

#[tokio::test]
async fn bulk_writes_and_aggregation() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    authors
        .create_bulk(Job::new("seed").with_records(vec![
            json!({ "_id": "a", "name": "A", "books": 2 }),
            json!({ "_id": "b", "name": "B", "books": 3 }),
            json!({ "_id": "c", "name": "C", "books": 5 }),
        ]))
        .await
        .unwrap();

    let updated = authors
        .update_bulk(Job::new("fix").with_records(vec![
            json!({ "_id": "a", "books": 4 }),
            json!({ "_id": "missing", "books": 9 }),
        ]))
        .await
        .unwrap();
    assert_eq!(updated.data.unwrap().as_array().unwrap().len(), 1);

    let removed = authors
        .delete_bulk(Job::new("prune").with_records(vec![json!("c")]))
        .await
        .unwrap();
    assert_eq!(removed.count, Some(1));

    let totals = authors
        .aggregate(Job::new("stats").with_payload(payload(json!({
            "aggregate": [{ "$group": { "_id": null, "books": { "$sum": "$books" }, "n": { "$sum": 1 } } }]
        }))))
        .await
        .unwrap();
    assert_eq!(totals.data, Some(json!([{ "_id": null, "books": 7, "n": 2 }])));
}

#[tokio::test]
async fn sub_documents_are_pushed_and_pulled() {
    let fx = Fixture::new();
    let authors = fx.service("authors");
    let repo = authors.persistence();
    authors
        .create(Job::new("seed").with_body(json!({ "_id": "a1", "name": "Ada" })))
        .await
        .unwrap();

    let pushed = repo
        .add_sub_document(&Job::new("tag").with_id("a1").with_body(json!({ "label": "math" })), "tags")
        .await
        .unwrap();
    let tags = pushed.data.unwrap()["tags"].clone();
    assert_eq!(tags.as_array().unwrap().len(), 1);
    assert!(tags[0]["_id"].is_string());

    let pulled = repo
        .remove_sub_document(&Job::new("untag").with_id("a1").with_body(json!({ "label": "math" })), "tags")
        .await
        .unwrap();
    assert_eq!(pulled.data.unwrap()["tags"], json!([]));

    let err = repo
        .add_sub_document(&Job::new("tag").with_id("nobody").with_body(json!({ "label": "x" })), "tags")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    // create + two sub-document updates
    assert_eq!(fx.audit.count(AuditKind::History), 3);
}

#[tokio::test]
async fn document_audit_sink_writes_to_log_collections() {
    let store = Arc::new(MemoryDocumentStore::new());
    let authors = EntityDescriptor::new("authors").with_history(true);
    let model = Arc::new(ResolvedModel::from_entities(vec![authors.clone()]));
    let repo = DocumentRepository::new(DocumentBackend::new(store.clone(), model), authors)
        .with_audit(Arc::new(DocumentAuditSink::new(store.clone())));
    let service = RecordService::new(repo);
    service
        .create(Job::new("seed").with_body(json!({ "name": "Ada" })))
        .await
        .unwrap();

    let mut logs = Vec::new();
    for _ in 0..50 {
        logs = store.dump("history_logs").await;
        if !logs.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["entity"], json!("authors"));
    assert_eq!(logs[0]["action"], json!("create"));
    assert_eq!(logs[0]["data"]["name"], json!("Ada"));
}
