//! Storage contracts for Sercha.
//!
//! Each entity family has its own trait so that backends can be mixed (e.g.
//! a durable document store with an in-memory scheduler store). Keyword and
//! vector retrieval are separate capabilities the search engine consumes
//! alongside [`DocumentStore`].
//!
//! Contract shared by every implementation:
//!
//! - lookups by id return [`Error::NotFound`](crate::Error::NotFound) when
//!   the entity is absent, never an empty success;
//! - list operations return an empty `Vec` when nothing matches;
//! - implementations are `Send + Sync` and safe for concurrent readers and
//!   writers.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    Chunk, Credentials, Document, Exclusion, ScheduledTask, Source, SyncState, TaskResult,
};

/// A candidate chunk returned from keyword or vector retrieval.
///
/// Carries enough information to normalise scores and group by document
/// without extra store round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Raw backend score, higher is better (term score or cosine similarity).
    pub raw_score: f64,
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Insert or replace a source by id.
    async fn save_source(&self, source: &Source) -> Result<()>;

    async fn get_source(&self, id: &str) -> Result<Source>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn delete_source(&self, id: &str) -> Result<()>;
}

/// Documents and their chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](DocumentStore::upsert_document) | Write a document and replace its chunks atomically |
/// | [`find_by_uri`](DocumentStore::find_by_uri) | Resolve identity by (source, URI) |
/// | [`get_chunks`](DocumentStore::get_chunks) | Chunks of a document in position order |
/// | [`delete_document`](DocumentStore::delete_document) | Remove a document and its chunks |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or update `doc` and replace all of its chunks with `chunks`.
    ///
    /// Both writes are applied together or not at all.
    async fn upsert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Document>;

    async fn find_by_uri(&self, source_id: &str, uri: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>>;

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn get_chunk(&self, id: &str) -> Result<Chunk>;

    /// Delete a document together with its chunks.
    async fn delete_document(&self, id: &str) -> Result<()>;

    /// Delete every document of a source. Returns the number removed.
    async fn delete_documents_for_source(&self, source_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get_sync_state(&self, source_id: &str) -> Result<SyncState>;

    async fn save_sync_state(&self, state: &SyncState) -> Result<()>;

    async fn delete_sync_state(&self, source_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ExclusionStore: Send + Sync {
    async fn add_exclusion(&self, exclusion: &Exclusion) -> Result<()>;

    async fn get_exclusion(&self, id: &str) -> Result<Exclusion>;

    async fn is_excluded(&self, source_id: &str, uri: &str) -> Result<bool>;

    /// Exclusions of one source, or all exclusions when `source_id` is `None`.
    async fn list_exclusions(&self, source_id: Option<&str>) -> Result<Vec<Exclusion>>;

    async fn remove_exclusion(&self, id: &str) -> Result<()>;

    async fn delete_exclusions_for_source(&self, source_id: &str) -> Result<usize>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or replace credentials. A source holds at most one row; saving
    /// credentials for a source replaces any previous row for it.
    async fn save_credentials(&self, credentials: &Credentials) -> Result<()>;

    async fn get_credentials(&self, id: &str) -> Result<Credentials>;

    async fn credentials_for_source(&self, source_id: &str) -> Result<Option<Credentials>>;

    async fn list_credentials(&self) -> Result<Vec<Credentials>>;

    async fn delete_credentials_for_source(&self, source_id: &str) -> Result<()>;
}

/// Persistent task state and execution history for the scheduler.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<ScheduledTask>;

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>>;

    async fn save_task(&self, task: &ScheduledTask) -> Result<()>;

    /// Append one execution record.
    async fn record_result(&self, result: &TaskResult) -> Result<()>;

    /// Most recent results first.
    async fn task_history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskResult>>;

    /// Keep only the newest `keep` results per task. Returns the number removed.
    async fn prune_history(&self, keep: usize) -> Result<usize>;
}

/// Full-text keyword retrieval over chunk content.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Best matches first. An empty `source_ids` means all sources.
    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        source_ids: &[String],
    ) -> Result<Vec<ChunkCandidate>>;
}

/// Similarity retrieval over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Most similar first. An empty `source_ids` means all sources.
    async fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        source_ids: &[String],
    ) -> Result<Vec<ChunkCandidate>>;
}

/// The entity stores the sync and catalog layers operate on.
#[derive(Clone)]
pub struct Stores {
    pub sources: Arc<dyn SourceStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub sync_states: Arc<dyn SyncStateStore>,
    pub exclusions: Arc<dyn ExclusionStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Stores {
    /// Fresh in-memory stores, used by tests and ephemeral hosts.
    pub fn in_memory() -> Self {
        Self {
            sources: Arc::new(memory::MemorySourceStore::new()),
            documents: Arc::new(memory::MemoryDocumentStore::new()),
            sync_states: Arc::new(memory::MemorySyncStateStore::new()),
            exclusions: Arc::new(memory::MemoryExclusionStore::new()),
            credentials: Arc::new(memory::MemoryCredentialStore::new()),
        }
    }
}
