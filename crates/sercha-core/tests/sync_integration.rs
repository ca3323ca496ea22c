//! Sync orchestrator behaviour against in-memory stores and scripted
//! connectors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sercha_core::auth::AuthCapability;
use sercha_core::catalog::Catalog;
use sercha_core::chunk::chunk_text;
use sercha_core::connector::{ChangeStream, Connector, ConnectorRegistry};
use sercha_core::models::{
    derive_id, CredentialSecret, Credentials, Cursor, RawDocument, RawDocumentChange, Source,
};
use sercha_core::normalise::NormaliserRegistry;
use sercha_core::pipeline::{ChunkerProcessor, DocumentPipeline};
use sercha_core::store::Stores;
use sercha_core::sync::SyncOrchestrator;
use sercha_core::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Replays a shared script of changes. Each change carries its index as
/// cursor and `open` resumes after the given cursor.
#[derive(Default)]
struct ScriptedConnector {
    kind: &'static str,
    auth: AuthCapability,
    script: Mutex<Vec<RawDocumentChange>>,
    /// Emitted after the script when set.
    trailing_error: Mutex<Option<String>>,
    opened_with: Mutex<Vec<Option<String>>>,
}

impl ScriptedConnector {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    fn push(&self, change: RawDocumentChange) {
        let mut script = self.script.lock().unwrap();
        let cursor = (script.len() + 1).to_string();
        script.push(change.with_cursor(cursor));
    }

    fn fail_at_end(&self, message: &str) {
        *self.trailing_error.lock().unwrap() = Some(message.to_string());
    }

    fn opened_with(&self) -> Vec<Option<String>> {
        self.opened_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn connector_type(&self) -> &str {
        self.kind
    }

    fn auth_capability(&self) -> AuthCapability {
        self.auth
    }

    async fn open(
        &self,
        _source: &Source,
        _credentials: Option<&Credentials>,
        cursor: Option<&Cursor>,
    ) -> sercha_core::Result<ChangeStream> {
        self.opened_with
            .lock()
            .unwrap()
            .push(cursor.map(|c| c.as_str().to_string()));
        let skip: usize = cursor.map(|c| c.as_str().parse().unwrap()).unwrap_or(0);
        let mut items: Vec<sercha_core::Result<RawDocumentChange>> = self
            .script
            .lock()
            .unwrap()
            .iter()
            .skip(skip)
            .cloned()
            .map(Ok)
            .collect();
        if let Some(message) = self.trailing_error.lock().unwrap().clone() {
            items.push(Err(Error::invalid(message)));
        }
        Ok(stream::iter(items).boxed())
    }
}

fn text(source_id: &str, uri: &str, body: &str) -> RawDocument {
    RawDocument::new(source_id, uri, "text/plain", body.as_bytes().to_vec())
}

struct Harness {
    stores: Stores,
    connector: Arc<ScriptedConnector>,
    orchestrator: Arc<SyncOrchestrator>,
    catalog: Catalog,
}

async fn harness_with(connector: ScriptedConnector, pipeline: DocumentPipeline) -> Harness {
    let stores = Stores::in_memory();
    let connector = Arc::new(connector);
    let mut connectors = ConnectorRegistry::new();
    connectors.register(connector.clone());
    let catalog = Catalog::new(stores.clone(), connectors.clone());
    catalog
        .add_source(&Source::new("fs-1", connector.kind, "Notes"))
        .await
        .unwrap();
    let orchestrator = Arc::new(SyncOrchestrator::new(
        stores.clone(),
        connectors,
        Arc::new(pipeline),
    ));
    Harness {
        stores,
        connector,
        orchestrator,
        catalog,
    }
}

async fn harness() -> Harness {
    harness_with(
        ScriptedConnector::new("filesystem"),
        DocumentPipeline::with_defaults(),
    )
    .await
}

#[tokio::test]
async fn test_first_sync_creates_document_and_cursor() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/a.txt", "hello world")));

    let report = h
        .orchestrator
        .sync_source("fs-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.items_processed, 1);
    assert_eq!(report.items_failed, 0);

    let docs = h.stores.documents.list_documents("fs-1").await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].uri, "/a.txt");
    assert_eq!(docs[0].source_id, "fs-1");

    let state = h.stores.sync_states.get_sync_state("fs-1").await.unwrap();
    assert!(!state.cursor.is_empty());
    assert_eq!(h.connector.opened_with(), vec![None]);
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/a.txt", "alpha")));
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/b.txt", "beta")));
    let cancel = CancellationToken::new();

    h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    let docs_before = h.stores.documents.list_documents("fs-1").await.unwrap();
    let chunks_before = h.stores.documents.get_chunks(&docs_before[0].id).await.unwrap();
    let cursor_before = h.stores.sync_states.get_sync_state("fs-1").await.unwrap().cursor;

    let second = h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    assert_eq!(second.items_processed, 0);
    assert_eq!(h.connector.opened_with()[1].as_deref(), Some("2"));

    // Replaying from scratch must not duplicate anything either.
    h.stores.sync_states.delete_sync_state("fs-1").await.unwrap();
    let replay = h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    assert_eq!(replay.items_processed, 2);

    // Documents come back identical, timestamps included.
    let docs_after = h.stores.documents.list_documents("fs-1").await.unwrap();
    assert_eq!(docs_after, docs_before);
    assert_eq!(
        h.stores.documents.get_chunks(&docs_after[0].id).await.unwrap(),
        chunks_before
    );
    assert_eq!(
        h.stores.sync_states.get_sync_state("fs-1").await.unwrap().cursor,
        cursor_before
    );
}

#[tokio::test]
async fn test_exclusion_blocks_and_restore_reindexes() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/secret.txt", "payroll")));
    let cancel = CancellationToken::new();
    h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();

    let doc = h
        .stores
        .documents
        .find_by_uri("fs-1", "/secret.txt")
        .await
        .unwrap()
        .unwrap();
    let exclusion = h.catalog.exclude_document(&doc.id, "private").await.unwrap();

    h.connector
        .push(RawDocumentChange::updated(text("fs-1", "/secret.txt", "payroll v2")));
    let report = h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    assert_eq!(report.items_skipped, 1);
    assert!(h
        .stores
        .documents
        .find_by_uri("fs-1", "/secret.txt")
        .await
        .unwrap()
        .is_none());
    // Skipped changes still advance the cursor.
    assert_eq!(report.cursor.as_ref().map(Cursor::as_str), Some("2"));

    h.catalog.remove_exclusion(&exclusion.id).await.unwrap();
    h.connector
        .push(RawDocumentChange::updated(text("fs-1", "/secret.txt", "payroll v3")));
    h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    let restored = h
        .stores
        .documents
        .find_by_uri("fs-1", "/secret.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.content, "payroll v3");
}

#[tokio::test]
async fn test_update_replaces_chunks_wholesale() {
    let pipeline = DocumentPipeline::new(
        NormaliserRegistry::with_defaults(),
        vec![Arc::new(ChunkerProcessor {
            chunk_size: 40,
            overlap: 0,
        })],
    );
    let h = harness_with(ScriptedConnector::new("filesystem"), pipeline).await;
    let long = ["one two three four five six seven eight."; 4].join(" ");
    let short = "one two three four five six seven eight nine ten eleven twelve thirteen";
    let expected_before = chunk_text("x", &long, 40, 0).len();
    let expected_after = chunk_text("x", short, 40, 0).len();
    assert!(expected_before > expected_after && expected_after >= 2);

    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/long.txt", &long)));
    let cancel = CancellationToken::new();
    h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    let doc_id = derive_id(&["fs-1", "/long.txt"]);
    assert_eq!(
        h.stores.documents.get_chunks(&doc_id).await.unwrap().len(),
        expected_before
    );

    h.connector
        .push(RawDocumentChange::updated(text("fs-1", "/long.txt", short)));
    h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
    let chunks = h.stores.documents.get_chunks(&doc_id).await.unwrap();
    let positions: Vec<usize> = chunks.iter().map(|c| c.position).collect();
    assert_eq!(positions, (0..expected_after).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_delete_change_removes_document() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/a.txt", "hello")));
    h.connector.push(RawDocumentChange::deleted("fs-1", "/a.txt"));
    h.connector.push(RawDocumentChange::deleted("fs-1", "/never.txt"));

    let report = h
        .orchestrator
        .sync_source("fs-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.items_processed, 3);
    assert_eq!(report.items_deleted, 1);
    assert!(h
        .stores
        .documents
        .list_documents("fs-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_item_failure_freezes_cursor() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/a.txt", "fine")));
    h.connector.push(RawDocumentChange::created(RawDocument::new(
        "fs-1",
        "/blob.bin",
        "application/octet-stream",
        vec![0u8, 1, 2],
    )));
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/c.txt", "also fine")));

    let report = h
        .orchestrator
        .sync_source("fs-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.items_processed, 2);
    assert_eq!(report.items_failed, 1);
    assert_eq!(report.failures[0].uri, "/blob.bin");
    assert!(report.error_summary().unwrap().contains("/blob.bin"));

    // Items after the failure are applied, but the cursor stays before it.
    assert!(h
        .stores
        .documents
        .find_by_uri("fs-1", "/c.txt")
        .await
        .unwrap()
        .is_some());
    let state = h.stores.sync_states.get_sync_state("fs-1").await.unwrap();
    assert_eq!(state.cursor.as_str(), "1");

    let status = h.orchestrator.status("fs-1").unwrap();
    assert!(!status.running);
    assert_eq!((status.processed, status.failed), (2, 1));
}

#[tokio::test]
async fn test_stream_error_keeps_last_commit() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/a.txt", "hello")));
    h.connector.fail_at_end("listing failed");

    let err = h
        .orchestrator
        .sync_source("fs-1", &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        Error::Connector { source_id, message } => {
            assert_eq!(source_id, "fs-1");
            assert!(message.contains("listing failed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let state = h.stores.sync_states.get_sync_state("fs-1").await.unwrap();
    assert_eq!(state.cursor.as_str(), "1");
    assert!(!h.orchestrator.is_syncing("fs-1"));
}

#[tokio::test]
async fn test_auth_required_without_credentials() {
    let connector = ScriptedConnector {
        auth: AuthCapability::PAT,
        ..ScriptedConnector::new("github")
    };
    let h = harness_with(connector, DocumentPipeline::with_defaults()).await;
    let cancel = CancellationToken::new();

    let err = h.orchestrator.sync_source("fs-1", &cancel).await.unwrap_err();
    assert!(matches!(err, Error::AuthRequired(id) if id == "fs-1"));

    h.catalog
        .set_credentials("fs-1", CredentialSecret::Pat { token: "t".into() }, None)
        .await
        .unwrap();
    h.orchestrator.sync_source("fs-1", &cancel).await.unwrap();
}

#[tokio::test]
async fn test_unknown_source_is_not_found() {
    let h = harness().await;
    let err = h
        .orchestrator
        .sync_source("nope", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

/// Yields one change, then waits on `gate` before ending.
struct GatedConnector {
    gate: Arc<Notify>,
}

#[async_trait]
impl Connector for GatedConnector {
    fn connector_type(&self) -> &str {
        "gated"
    }

    async fn open(
        &self,
        source: &Source,
        _credentials: Option<&Credentials>,
        _cursor: Option<&Cursor>,
    ) -> sercha_core::Result<ChangeStream> {
        let first = RawDocumentChange::created(text(&source.id, "/a.txt", "hello")).with_cursor("1");
        let gate = self.gate.clone();
        let rest = stream::once(async move {
            gate.notified().await;
            Ok(RawDocumentChange::created(text("g-1", "/b.txt", "later")).with_cursor("2"))
        });
        Ok(stream::iter(vec![Ok(first)]).chain(rest).boxed())
    }
}

async fn gated() -> (Arc<SyncOrchestrator>, Stores, Arc<Notify>) {
    let stores = Stores::in_memory();
    let gate = Arc::new(Notify::new());
    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(GatedConnector { gate: gate.clone() }));
    stores
        .sources
        .save_source(&Source::new("g-1", "gated", "Gated"))
        .await
        .unwrap();
    let orchestrator = Arc::new(SyncOrchestrator::new(
        stores.clone(),
        connectors,
        Arc::new(DocumentPipeline::with_defaults()),
    ));
    (orchestrator, stores, gate)
}

async fn wait_for_progress(orchestrator: &SyncOrchestrator, processed: usize) {
    for _ in 0..500 {
        if orchestrator
            .status("g-1")
            .is_some_and(|s| s.running && s.processed >= processed)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("sync never reached {processed} processed items");
}

#[tokio::test]
async fn test_concurrent_sync_of_same_source_is_rejected() {
    let (orchestrator, _stores, gate) = gated().await;
    let cancel = CancellationToken::new();
    let running = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.sync_source("g-1", &cancel).await })
    };
    wait_for_progress(&orchestrator, 1).await;

    let err = orchestrator.sync_source("g-1", &cancel).await.unwrap_err();
    assert!(matches!(err, Error::SyncInProgress(_)));

    gate.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.items_processed, 2);
    assert!(!orchestrator.is_syncing("g-1"));
}

#[tokio::test]
async fn test_remove_source_waits_for_running_sync() {
    let (orchestrator, stores, gate) = gated().await;
    let catalog = Catalog::new(stores.clone(), orchestrator.connectors().clone())
        .with_orchestrator(orchestrator.clone());
    let cancel = CancellationToken::new();
    let running = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.sync_source("g-1", &cancel).await })
    };
    wait_for_progress(&orchestrator, 1).await;

    let err = catalog.remove_source("g-1").await.unwrap_err();
    assert!(matches!(err, Error::SyncInProgress(_)));
    assert!(stores.sources.get_source("g-1").await.is_ok());

    gate.notify_one();
    running.await.unwrap().unwrap();
    let removed = catalog.remove_source("g-1").await.unwrap();
    assert_eq!(removed.documents, 2);
    assert!(stores.documents.list_documents("g-1").await.unwrap().is_empty());
    assert!(orchestrator.status("g-1").is_none());
    assert!(orchestrator
        .sync_source("g-1", &cancel)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_cancel_keeps_committed_cursor() {
    let (orchestrator, stores, _gate) = gated().await;
    let cancel = CancellationToken::new();
    let running = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.sync_source("g-1", &cancel).await })
    };
    wait_for_progress(&orchestrator, 1).await;
    cancel.cancel();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    let state = stores.sync_states.get_sync_state("g-1").await.unwrap();
    assert_eq!(state.cursor.as_str(), "1");
    assert!(!orchestrator.is_syncing("g-1"));
}

#[tokio::test]
async fn test_sync_all_isolates_failures() {
    let h = harness().await;
    h.connector
        .push(RawDocumentChange::created(text("fs-1", "/a.txt", "hello")));
    h.stores
        .sources
        .save_source(&Source::new("orphan", "imap", "Mail"))
        .await
        .unwrap();

    let outcomes = h
        .orchestrator
        .sync_all(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    let fs = outcomes.iter().find(|o| o.source_id == "fs-1").unwrap();
    assert!(matches!(
        fs.outcome,
        sercha_core::sync::SyncOutcome::Completed(_)
    ));
    let orphan = outcomes.iter().find(|o| o.source_id == "orphan").unwrap();
    assert!(matches!(
        orphan.outcome,
        sercha_core::sync::SyncOutcome::Failed(Error::UnsupportedType(_))
    ));
}
