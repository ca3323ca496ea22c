//! Store contracts against a real SQLite database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sercha::db::connect_path;
use sercha::migrate::run_migrations;
use sercha::sqlite_store::SqliteStore;
use sercha_core::chunk::chunk_id;
use sercha_core::models::{
    derive_id, Chunk, CredentialSecret, Credentials, Cursor, Document, Exclusion, Metadata,
    ScheduledTask, Source, SyncState, TaskResult,
};
use sercha_core::store::{
    CredentialStore, DocumentStore, ExclusionStore, KeywordIndex, SchedulerStore, SourceStore,
    SyncStateStore, VectorIndex,
};
use sercha_core::Error;
use tempfile::TempDir;

async fn open() -> (TempDir, Arc<SqliteStore>) {
    let dir = TempDir::new().unwrap();
    let pool = connect_path(&dir.path().join("data/sercha.sqlite"))
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    (dir, Arc::new(SqliteStore::new(pool)))
}

fn doc(source_id: &str, uri: &str, content: &str) -> Document {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("mime_type".into(), "text/plain".into());
    Document {
        id: derive_id(&[source_id, uri]),
        source_id: source_id.to_string(),
        uri: uri.to_string(),
        title: uri.trim_start_matches('/').to_string(),
        content: content.to_string(),
        parent_id: None,
        metadata,
        created_at: at,
        updated_at: at,
    }
}

fn chunks(doc: &Document, parts: &[&str], embeddings: Option<&[Vec<f32>]>) -> Vec<Chunk> {
    parts
        .iter()
        .enumerate()
        .map(|(position, content)| Chunk {
            id: chunk_id(&doc.id, position),
            document_id: doc.id.clone(),
            content: content.to_string(),
            position,
            embedding: embeddings.map(|e| e[position].clone()),
            metadata: Metadata::new(),
        })
        .collect()
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let (_dir, store) = open().await;
    run_migrations(store.pool()).await.unwrap();
    run_migrations(store.pool()).await.unwrap();
    assert_eq!(store.document_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_source_crud_roundtrip() {
    let (_dir, store) = open().await;
    let source = Source::new("fs-1", "filesystem", "Notes").with_config("root", "/tmp/notes");
    store.save_source(&source).await.unwrap();

    let loaded = store.get_source("fs-1").await.unwrap();
    assert_eq!(loaded.config.get("root").map(String::as_str), Some("/tmp/notes"));
    assert_eq!(loaded.created_at, source.created_at);

    let mut renamed = loaded.clone();
    renamed.name = "Work notes".into();
    store.save_source(&renamed).await.unwrap();
    assert_eq!(store.list_sources().await.unwrap().len(), 1);
    assert_eq!(store.get_source("fs-1").await.unwrap().name, "Work notes");

    store.delete_source("fs-1").await.unwrap();
    assert!(store.get_source("fs-1").await.unwrap_err().is_not_found());
    assert!(store.delete_source("fs-1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_upsert_replaces_chunks_and_index() {
    let (_dir, store) = open().await;
    let d = doc("fs-1", "/a.txt", "alpha beta");
    store
        .upsert_document(&d, &chunks(&d, &["alpha apples", "beta bananas", "gamma"], None))
        .await
        .unwrap();
    assert_eq!(store.get_chunks(&d.id).await.unwrap().len(), 3);

    store
        .upsert_document(&d, &chunks(&d, &["delta dates"], None))
        .await
        .unwrap();
    let stored = store.get_chunks(&d.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "delta dates");

    // Old chunk text is no longer searchable.
    assert!(store.keyword_search("bananas", 10, &[]).await.unwrap().is_empty());
    assert_eq!(store.keyword_search("dates", 10, &[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upsert_rejects_foreign_chunks_without_writing() {
    let (_dir, store) = open().await;
    let a = doc("fs-1", "/a.txt", "a");
    let b = doc("fs-1", "/b.txt", "b");
    let err = store
        .upsert_document(&a, &chunks(&b, &["stray"], None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(store.get_document(&a.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_same_uri_with_new_id_supersedes_old_document() {
    let (_dir, store) = open().await;
    let original = doc("fs-1", "/a.txt", "first");
    store
        .upsert_document(&original, &chunks(&original, &["first version"], None))
        .await
        .unwrap();

    let mut replacement = doc("fs-1", "/a.txt", "second");
    replacement.id = "replacement-id".into();
    store
        .upsert_document(&replacement, &chunks(&replacement, &["second version"], None))
        .await
        .unwrap();

    let found = store.find_by_uri("fs-1", "/a.txt").await.unwrap().unwrap();
    assert_eq!(found.id, "replacement-id");
    assert!(store.get_document(&original.id).await.unwrap_err().is_not_found());
    assert!(store.keyword_search("first", 10, &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_document_and_source_documents() {
    let (_dir, store) = open().await;
    for (source, uri) in [("fs-1", "/a.txt"), ("fs-1", "/b.txt"), ("fs-2", "/c.txt")] {
        let d = doc(source, uri, "shared words");
        store
            .upsert_document(&d, &chunks(&d, &["shared words"], None))
            .await
            .unwrap();
    }
    let a = doc("fs-1", "/a.txt", "");
    store.delete_document(&a.id).await.unwrap();
    assert!(store.delete_document(&a.id).await.unwrap_err().is_not_found());
    assert!(store.get_chunks(&a.id).await.unwrap().is_empty());

    assert_eq!(store.delete_documents_for_source("fs-1").await.unwrap(), 1);
    assert_eq!(store.document_count().await.unwrap(), 1);
    let hits = store.keyword_search("shared", 10, &[]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_id, derive_id(&["fs-2", "/c.txt"]));
}

#[tokio::test]
async fn test_keyword_search_ranks_and_filters() {
    let (_dir, store) = open().await;
    let invoice = doc("mail", "/invoice", "");
    store
        .upsert_document(
            &invoice,
            &chunks(&invoice, &["invoice invoice quarterly invoice total", "unrelated"], None),
        )
        .await
        .unwrap();
    let memo = doc("notes", "/memo", "");
    store
        .upsert_document(&memo, &chunks(&memo, &["memo mentions an invoice once among many other words"], None))
        .await
        .unwrap();

    let hits = store.keyword_search("Invoice!", 10, &[]).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document_id, invoice.id);
    assert!(hits[0].raw_score > hits[1].raw_score);

    let filtered = store
        .keyword_search("invoice", 10, &["notes".to_string()])
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].document_id, memo.id);

    assert!(store.keyword_search("   ", 10, &[]).await.unwrap().is_empty());
    assert_eq!(store.keyword_search("invoice", 1, &[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_vector_search_by_cosine() {
    let (_dir, store) = open().await;
    let d = doc("fs-1", "/v.txt", "");
    let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]];
    store
        .upsert_document(&d, &chunks(&d, &["x", "y", "xy"], Some(vectors.as_slice())))
        .await
        .unwrap();
    let other = doc("fs-2", "/w.txt", "");
    store
        .upsert_document(&other, &chunks(&other, &["wrong dims"], Some(&[vec![1.0f32, 0.0, 0.0]][..])))
        .await
        .unwrap();

    let hits = store.vector_search(&[1.0, 0.1], 2, &[]).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk_id, chunk_id(&d.id, 0));
    assert_eq!(hits[1].chunk_id, chunk_id(&d.id, 2));

    let stored = store.get_chunk(&chunk_id(&d.id, 2)).await.unwrap();
    assert_eq!(stored.embedding.as_deref(), Some(&[0.7f32, 0.7][..]));

    assert!(store
        .vector_search(&[1.0, 0.0], 5, &["fs-2".to_string()])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sync_state_roundtrip() {
    let (_dir, store) = open().await;
    assert!(store.get_sync_state("fs-1").await.unwrap_err().is_not_found());
    let state = SyncState {
        source_id: "fs-1".into(),
        cursor: Cursor::new("42:a.txt"),
        last_sync: Utc::now(),
    };
    store.save_sync_state(&state).await.unwrap();
    assert_eq!(store.get_sync_state("fs-1").await.unwrap(), state);
    store.delete_sync_state("fs-1").await.unwrap();
    store.delete_sync_state("fs-1").await.unwrap();
    assert!(store.get_sync_state("fs-1").await.is_err());
}

#[tokio::test]
async fn test_exclusions_reject_duplicates() {
    let (_dir, store) = open().await;
    let first = Exclusion::new("fs-1", "doc-1", "/a.txt", "noise");
    store.add_exclusion(&first).await.unwrap();
    let again = Exclusion::new("fs-1", "doc-1", "/a.txt", "still noise");
    assert!(matches!(
        store.add_exclusion(&again).await.unwrap_err(),
        Error::AlreadyExists(_)
    ));
    assert!(store.is_excluded("fs-1", "/a.txt").await.unwrap());
    assert!(!store.is_excluded("fs-2", "/a.txt").await.unwrap());

    store
        .add_exclusion(&Exclusion::new("fs-2", "doc-2", "/b.txt", "x"))
        .await
        .unwrap();
    assert_eq!(store.list_exclusions(None).await.unwrap().len(), 2);
    assert_eq!(store.list_exclusions(Some("fs-1")).await.unwrap(), vec![first.clone()]);

    store.remove_exclusion(&first.id).await.unwrap();
    assert!(store.remove_exclusion(&first.id).await.unwrap_err().is_not_found());
    assert_eq!(store.delete_exclusions_for_source("fs-2").await.unwrap(), 1);
}

#[tokio::test]
async fn test_credentials_one_row_per_source() {
    let (_dir, store) = open().await;
    let pat = Credentials::new("gh", CredentialSecret::Pat { token: "one".into() });
    store.save_credentials(&pat).await.unwrap();
    let mut replaced = Credentials::new("gh", CredentialSecret::Pat { token: "two".into() });
    replaced.account_identifier = Some("me@example.com".into());
    store.save_credentials(&replaced).await.unwrap();

    let all = store.list_credentials().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0], replaced);
    assert!(store.get_credentials(&pat.id).await.unwrap_err().is_not_found());
    assert_eq!(
        store.credentials_for_source("gh").await.unwrap().unwrap().access_token(),
        Some("two")
    );

    store.delete_credentials_for_source("gh").await.unwrap();
    assert!(store.credentials_for_source("gh").await.unwrap().is_none());
}

fn result(task_id: &str, offset_secs: i64, success: bool) -> TaskResult {
    let started_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        + chrono::Duration::seconds(offset_secs);
    TaskResult {
        task_id: task_id.into(),
        started_at,
        ended_at: started_at + chrono::Duration::milliseconds(250),
        success,
        error: (!success).then(|| "boom".to_string()),
        items_processed: 3,
        items_failed: usize::from(!success),
    }
}

#[tokio::test]
async fn test_scheduler_rows_and_history() {
    let (_dir, store) = open().await;
    let mut task = ScheduledTask::new("document-sync", "Document sync", Duration::from_secs(3600));
    task.enabled = true;
    store.save_task(&task).await.unwrap();
    assert_eq!(store.get_task("document-sync").await.unwrap(), task);

    let first = result("document-sync", 0, false);
    task.apply_result(&first);
    store.save_task(&task).await.unwrap();
    let loaded = store.get_task("document-sync").await.unwrap();
    assert_eq!(loaded.last_error.as_deref(), Some("boom"));
    assert_eq!(loaded.next_run, Some(first.started_at + chrono::Duration::hours(1)));
    assert!(store.get_task("missing").await.unwrap_err().is_not_found());

    for i in 0..5 {
        store.record_result(&result("document-sync", i, true)).await.unwrap();
        store.record_result(&result("oauth-refresh", i, true)).await.unwrap();
    }
    let history = store.task_history("document-sync", 3).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].started_at, result("x", 4, true).started_at);

    assert_eq!(store.prune_history(2).await.unwrap(), 6);
    assert_eq!(store.task_history("document-sync", 10).await.unwrap().len(), 2);
    assert_eq!(store.task_history("oauth-refresh", 10).await.unwrap().len(), 2);
}
