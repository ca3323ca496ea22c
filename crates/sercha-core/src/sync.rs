//! Incremental per-source sync orchestrator.
//!
//! Drives one source's change stream through exclusion filtering, the
//! [`Pipeline`], and the [`DocumentStore`](crate::store::DocumentStore),
//! committing the connector's cursor after every applied change.
//!
//! # Commit rules
//!
//! - A change is applied by writing the document and its chunks in one
//!   store call, then the change's cursor (if any) is saved. The cursor save
//!   is the commit point.
//! - Excluded URIs are skipped but still advance the cursor.
//! - A failed item is recorded and skipped. From then on the committed
//!   cursor stays frozen for the rest of the run, so the failed item is
//!   re-delivered next time. Later items are still applied; re-delivery is
//!   harmless because upserts are keyed by (source, URI).
//! - A stream error, a store failure while committing, or cancellation ends
//!   the run with an error; the cursor stays at the last commit.
//! - At most one run per source at a time; a second request fails with
//!   [`Error::SyncInProgress`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::chunk::chunk_id;
use crate::connector::ConnectorRegistry;
use crate::error::{Error, Result};
use crate::models::{ChangeType, Cursor, Document, RawDocumentChange, Source, SyncState};
use crate::pipeline::{Pipeline, ProcessedDocument};
use crate::store::Stores;

/// Live progress of a source's sync. Kept after the run ends with
/// `running = false` and the final counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub processed: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub uri: String,
    pub error: String,
}

/// Outcome of a run that reached the end of the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub source_id: String,
    /// Applied creates, updates and deletes.
    pub items_processed: usize,
    pub items_failed: usize,
    /// Changes skipped because the URI is excluded.
    pub items_skipped: usize,
    pub items_deleted: usize,
    /// Cursor persisted at the end of the run.
    pub cursor: Option<Cursor>,
    pub failures: Vec<ItemFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    /// `None` when every item was applied.
    pub fn error_summary(&self) -> Option<String> {
        let first = self.failures.first()?;
        Some(format!(
            "{} item(s) failed in source {}; first: {}: {}",
            self.items_failed, self.source_id, first.uri, first.error
        ))
    }
}

/// Result of one source within [`SyncOrchestrator::sync_all`].
#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run for the source was already in progress.
    Skipped,
    Failed(Error),
}

#[derive(Debug)]
pub struct SourceSyncOutcome {
    pub source_id: String,
    pub outcome: SyncOutcome,
}

enum Applied {
    Upserted,
    Deleted,
    /// Delete for a URI that is not stored.
    Absent,
    Excluded,
}

pub struct SyncOrchestrator {
    stores: Stores,
    connectors: ConnectorRegistry,
    pipeline: Arc<dyn Pipeline>,
    active: Mutex<HashMap<String, SyncStatus>>,
}

/// Marks a source as running for as long as it lives.
pub(crate) struct ActiveSync<'a> {
    active: &'a Mutex<HashMap<String, SyncStatus>>,
    source_id: String,
}

impl ActiveSync<'_> {
    fn progress(&self, processed: usize, failed: usize) {
        if let Some(status) = lock(self.active).get_mut(&self.source_id) {
            status.processed = processed;
            status.failed = failed;
        }
    }
}

impl Drop for ActiveSync<'_> {
    fn drop(&mut self) {
        if let Some(status) = lock(self.active).get_mut(&self.source_id) {
            status.running = false;
        }
    }
}

/// Exclusive hold on a source taken outside a sync run.
pub(crate) struct Reservation<'a> {
    hold: ActiveSync<'a>,
    active: &'a Mutex<HashMap<String, SyncStatus>>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.hold.source_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncOrchestrator {
    pub fn new(stores: Stores, connectors: ConnectorRegistry, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            stores,
            connectors,
            pipeline,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Progress of the current or most recent run of `source_id` in this
    /// process.
    pub fn status(&self, source_id: &str) -> Option<SyncStatus> {
        lock(&self.active).get(source_id).cloned()
    }

    pub fn is_syncing(&self, source_id: &str) -> bool {
        self.status(source_id).is_some_and(|s| s.running)
    }

    /// Hold `source_id` against new runs until the guard drops, failing
    /// with [`Error::SyncInProgress`] while one is active. The source's
    /// status entry is removed when the guard goes away.
    pub(crate) fn reserve(&self, source_id: &str) -> Result<Reservation<'_>> {
        Ok(Reservation {
            hold: self.begin(source_id)?,
            active: &self.active,
        })
    }

    fn begin(&self, source_id: &str) -> Result<ActiveSync<'_>> {
        let mut active = lock(&self.active);
        if active.get(source_id).is_some_and(|s| s.running) {
            return Err(Error::SyncInProgress(source_id.to_string()));
        }
        active.insert(
            source_id.to_string(),
            SyncStatus {
                running: true,
                processed: 0,
                failed: 0,
                started_at: Some(Utc::now()),
            },
        );
        Ok(ActiveSync {
            active: &self.active,
            source_id: source_id.to_string(),
        })
    }

    /// Bring one source up to date with its origin.
    pub async fn sync_source(&self, source_id: &str, cancel: &CancellationToken) -> Result<SyncReport> {
        let guard = self.begin(source_id)?;
        self.run(source_id, cancel, &guard)
            .instrument(info_span!("sync", source_id = %source_id))
            .await
    }

    /// Sync every configured source in turn. Failures are isolated per
    /// source. After cancellation every source not yet synced is reported
    /// as [`SyncOutcome::Failed`] with [`Error::Cancelled`].
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<Vec<SourceSyncOutcome>> {
        let sources = self.stores.sources.list_sources().await?;
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            let outcome = if cancel.is_cancelled() {
                SyncOutcome::Failed(Error::Cancelled)
            } else {
                self.sync_one(&source.id, cancel).await
            };
            outcomes.push(SourceSyncOutcome {
                source_id: source.id,
                outcome,
            });
        }
        Ok(outcomes)
    }

    async fn sync_one(&self, source_id: &str, cancel: &CancellationToken) -> SyncOutcome {
        match self.sync_source(source_id, cancel).await {
            Ok(report) => SyncOutcome::Completed(report),
            Err(Error::SyncInProgress(_)) => {
                debug!(source_id = %source_id, "sync already running, skipped");
                SyncOutcome::Skipped
            }
            Err(err) => {
                warn!(source_id = %source_id, error = %err, "source sync failed");
                SyncOutcome::Failed(err)
            }
        }
    }

    async fn run(
        &self,
        source_id: &str,
        cancel: &CancellationToken,
        guard: &ActiveSync<'_>,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();
        let source = self.stores.sources.get_source(source_id).await?;
        let connector = self.connectors.get(&source.source_type)?;
        let credentials = self
            .stores
            .credentials
            .credentials_for_source(&source.id)
            .await?;
        if connector.auth_capability().requires_auth() && credentials.is_none() {
            return Err(Error::AuthRequired(source.id.clone()));
        }
        connector.validate(&source, credentials.as_ref()).await?;

        let previous = match self.stores.sync_states.get_sync_state(&source.id).await {
            Ok(state) => Some(state),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let mut committed = previous
            .as_ref()
            .map(|s| s.cursor.clone())
            .filter(|c| !c.is_empty());
        let last_sync = previous.as_ref().map(|s| s.last_sync);

        info!(
            source_type = %source.source_type,
            resume = committed.is_some(),
            "sync started"
        );

        let mut stream = connector
            .open(&source, credentials.as_ref(), committed.as_ref())
            .await?;

        let mut report = SyncReport {
            source_id: source.id.clone(),
            items_processed: 0,
            items_failed: 0,
            items_skipped: 0,
            items_deleted: 0,
            cursor: None,
            failures: Vec::new(),
            started_at,
            finished_at: started_at,
        };
        let mut frozen = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };
            let Some(polled) = next else {
                info!(processed = report.items_processed, "sync cancelled");
                return Err(Error::Cancelled);
            };
            let Some(item) = polled else { break };

            let change = item.map_err(|err| match err {
                Error::Connector { .. } | Error::Cancelled | Error::AuthRequired(_) => err,
                other => Error::Connector {
                    source_id: source.id.clone(),
                    message: other.to_string(),
                },
            })?;

            match self.apply_change(&source, &change).await {
                Ok(Applied::Upserted) | Ok(Applied::Absent) => report.items_processed += 1,
                Ok(Applied::Deleted) => {
                    report.items_processed += 1;
                    report.items_deleted += 1;
                }
                Ok(Applied::Excluded) => {
                    debug!(uri = %change.document.uri, "excluded, skipped");
                    report.items_skipped += 1;
                }
                Err(err) => {
                    warn!(uri = %change.document.uri, error = %err, "item failed, skipped");
                    report.items_failed += 1;
                    report.failures.push(ItemFailure {
                        uri: change.document.uri.clone(),
                        error: err.to_string(),
                    });
                    if !frozen {
                        debug!("cursor frozen after item failure");
                    }
                    frozen = true;
                    guard.progress(report.items_processed, report.items_failed);
                    continue;
                }
            }
            guard.progress(report.items_processed, report.items_failed);

            if frozen {
                continue;
            }
            if let Some(cursor) = change.cursor {
                self.commit(&source.id, &cursor, last_sync.unwrap_or(started_at))
                    .await?;
                committed = Some(cursor);
            }
        }

        let finished_at = Utc::now();
        self.stores
            .sync_states
            .save_sync_state(&SyncState {
                source_id: source.id.clone(),
                cursor: committed.clone().unwrap_or_default(),
                last_sync: finished_at,
            })
            .await?;

        report.cursor = committed;
        report.finished_at = finished_at;
        info!(
            processed = report.items_processed,
            failed = report.items_failed,
            skipped = report.items_skipped,
            deleted = report.items_deleted,
            "sync finished"
        );
        Ok(report)
    }

    async fn commit(&self, source_id: &str, cursor: &Cursor, last_sync: DateTime<Utc>) -> Result<()> {
        debug!(cursor = %cursor.as_str(), "cursor committed");
        self.stores
            .sync_states
            .save_sync_state(&SyncState {
                source_id: source_id.to_string(),
                cursor: cursor.clone(),
                last_sync,
            })
            .await
    }

    async fn apply_change(&self, source: &Source, change: &RawDocumentChange) -> Result<Applied> {
        let uri = change.document.uri.as_str();
        if self.stores.exclusions.is_excluded(&source.id, uri).await? {
            return Ok(Applied::Excluded);
        }

        match change.change_type {
            ChangeType::Created | ChangeType::Updated => {
                let mut raw = change.document.clone();
                raw.source_id = source.id.clone();
                let ProcessedDocument {
                    mut document,
                    mut chunks,
                } = self.pipeline.process(&raw).await?;

                if let Some(existing) = self.stores.documents.find_by_uri(&source.id, uri).await? {
                    if existing.id != document.id {
                        document.id = existing.id.clone();
                        for chunk in &mut chunks {
                            chunk.document_id = existing.id.clone();
                            chunk.id = chunk_id(&existing.id, chunk.position);
                        }
                    }
                    document.created_at = existing.created_at;
                    if same_revision(&existing, &document) {
                        document.updated_at = existing.updated_at;
                    }
                }

                self.stores
                    .documents
                    .upsert_document(&document, &chunks)
                    .await?;
                Ok(Applied::Upserted)
            }
            ChangeType::Deleted => match self.stores.documents.find_by_uri(&source.id, uri).await? {
                Some(existing) => {
                    self.stores.documents.delete_document(&existing.id).await?;
                    Ok(Applied::Deleted)
                }
                None => Ok(Applied::Absent),
            },
        }
    }
}

/// A replayed change with identical normalised output keeps the stored
/// `updated_at`, so re-delivery leaves the document byte-for-byte unchanged.
fn same_revision(existing: &Document, incoming: &Document) -> bool {
    existing.title == incoming.title
        && existing.content == incoming.content
        && existing.metadata == incoming.metadata
        && existing.parent_id == incoming.parent_id
}
