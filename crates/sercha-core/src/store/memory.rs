//! In-memory store implementations for tests and ephemeral hosts.
//!
//! Every store keeps its maps behind a `std::sync::RwLock`. Keyword search
//! is a term-frequency scan and vector search is brute-force cosine
//! similarity, both over the chunks held by [`MemoryDocumentStore`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{
    Chunk, Credentials, Document, Exclusion, ScheduledTask, Source, SyncState, TaskResult,
};
use crate::search::tokenize;

use super::{
    ChunkCandidate, CredentialStore, DocumentStore, ExclusionStore, KeywordIndex, SchedulerStore,
    SourceStore, SyncStateStore, VectorIndex,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn rank(candidates: &mut Vec<ChunkCandidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(limit);
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySourceStore {
    sources: RwLock<HashMap<String, Source>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn save_source(&self, source: &Source) -> Result<()> {
        write(&self.sources).insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Source> {
        read(&self.sources)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("source {id}")))
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = read(&self.sources).values().cloned().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sources)
    }

    async fn delete_source(&self, id: &str) -> Result<()> {
        write(&self.sources)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("source {id}")))
    }
}

// ---------------------------------------------------------------------------
// Documents, chunks, keyword and vector retrieval
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DocumentData {
    docs: HashMap<String, Document>,
    /// Chunks per document id, in position order.
    chunks: HashMap<String, Vec<Chunk>>,
    /// (source_id, uri) → document id.
    by_uri: HashMap<(String, String), String>,
}

impl DocumentData {
    fn remove(&mut self, id: &str) -> Option<Document> {
        let doc = self.docs.remove(id)?;
        self.chunks.remove(id);
        self.by_uri.remove(&(doc.source_id.clone(), doc.uri.clone()));
        Some(doc)
    }

    fn in_sources(&self, document_id: &str, source_ids: &[String]) -> bool {
        source_ids.is_empty()
            || self
                .docs
                .get(document_id)
                .is_some_and(|d| source_ids.contains(&d.source_id))
    }
}

/// Documents and chunks under a single lock, so that a document and its
/// chunks are always observed together.
#[derive(Default)]
pub struct MemoryDocumentStore {
    data: RwLock<DocumentData>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> usize {
        read(&self.data).docs.len()
    }

    pub fn chunk_count(&self) -> usize {
        read(&self.data).chunks.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(stray) = chunks.iter().find(|c| c.document_id != doc.id) {
            return Err(Error::invalid(format!(
                "chunk {} belongs to document {}, not {}",
                stray.id, stray.document_id, doc.id
            )));
        }
        let mut ordered = chunks.to_vec();
        ordered.sort_by_key(|c| c.position);

        let mut data = write(&self.data);
        let key = (doc.source_id.clone(), doc.uri.clone());
        if let Some(previous) = data.by_uri.get(&key).cloned() {
            if previous != doc.id {
                data.remove(&previous);
            }
        }
        data.by_uri.insert(key, doc.id.clone());
        data.docs.insert(doc.id.clone(), doc.clone());
        data.chunks.insert(doc.id.clone(), ordered);
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Document> {
        read(&self.data)
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("document {id}")))
    }

    async fn find_by_uri(&self, source_id: &str, uri: &str) -> Result<Option<Document>> {
        let data = read(&self.data);
        Ok(data
            .by_uri
            .get(&(source_id.to_string(), uri.to_string()))
            .and_then(|id| data.docs.get(id))
            .cloned())
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = read(&self.data)
            .docs
            .values()
            .filter(|d| d.source_id == source_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(docs)
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        Ok(read(&self.data)
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_chunk(&self, id: &str) -> Result<Chunk> {
        read(&self.data)
            .chunks
            .values()
            .flatten()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("chunk {id}")))
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        write(&self.data)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("document {id}")))
    }

    async fn delete_documents_for_source(&self, source_id: &str) -> Result<usize> {
        let mut data = write(&self.data);
        let ids: Vec<String> = data
            .docs
            .values()
            .filter(|d| d.source_id == source_id)
            .map(|d| d.id.clone())
            .collect();
        for id in &ids {
            data.remove(id);
        }
        Ok(ids.len())
    }
}

#[async_trait]
impl KeywordIndex for MemoryDocumentStore {
    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        source_ids: &[String],
    ) -> Result<Vec<ChunkCandidate>> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let data = read(&self.data);
        let mut candidates: Vec<ChunkCandidate> = data
            .chunks
            .iter()
            .filter(|(doc_id, _)| data.in_sources(doc_id, source_ids))
            .flat_map(|(_, chunks)| chunks.iter())
            .filter_map(|chunk| {
                let tokens = tokenize(&chunk.content);
                let hits = tokens
                    .iter()
                    .filter(|t| terms.iter().any(|q| q == *t))
                    .count();
                (hits > 0).then(|| ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    raw_score: hits as f64 / (tokens.len() as f64).sqrt(),
                })
            })
            .collect();
        rank(&mut candidates, limit);
        Ok(candidates)
    }
}

#[async_trait]
impl VectorIndex for MemoryDocumentStore {
    async fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        source_ids: &[String],
    ) -> Result<Vec<ChunkCandidate>> {
        if vector.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let data = read(&self.data);
        let mut candidates: Vec<ChunkCandidate> = data
            .chunks
            .iter()
            .filter(|(doc_id, _)| data.in_sources(doc_id, source_ids))
            .flat_map(|(_, chunks)| chunks.iter())
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_deref()?;
                (embedding.len() == vector.len()).then(|| ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    raw_score: cosine_similarity(vector, embedding) as f64,
                })
            })
            .collect();
        rank(&mut candidates, limit);
        Ok(candidates)
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySyncStateStore {
    states: RwLock<HashMap<String, SyncState>>,
}

impl MemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for MemorySyncStateStore {
    async fn get_sync_state(&self, source_id: &str) -> Result<SyncState> {
        read(&self.states)
            .get(source_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("sync state for source {source_id}")))
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        write(&self.states).insert(state.source_id.clone(), state.clone());
        Ok(())
    }

    async fn delete_sync_state(&self, source_id: &str) -> Result<()> {
        write(&self.states).remove(source_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Exclusions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryExclusionStore {
    exclusions: RwLock<HashMap<String, Exclusion>>,
}

impl MemoryExclusionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExclusionStore for MemoryExclusionStore {
    async fn add_exclusion(&self, exclusion: &Exclusion) -> Result<()> {
        let mut exclusions = write(&self.exclusions);
        if exclusions
            .values()
            .any(|e| e.source_id == exclusion.source_id && e.uri == exclusion.uri)
        {
            return Err(Error::AlreadyExists(format!(
                "exclusion for {} in source {}",
                exclusion.uri, exclusion.source_id
            )));
        }
        exclusions.insert(exclusion.id.clone(), exclusion.clone());
        Ok(())
    }

    async fn get_exclusion(&self, id: &str) -> Result<Exclusion> {
        read(&self.exclusions)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("exclusion {id}")))
    }

    async fn is_excluded(&self, source_id: &str, uri: &str) -> Result<bool> {
        Ok(read(&self.exclusions)
            .values()
            .any(|e| e.source_id == source_id && e.uri == uri))
    }

    async fn list_exclusions(&self, source_id: Option<&str>) -> Result<Vec<Exclusion>> {
        let mut list: Vec<Exclusion> = read(&self.exclusions)
            .values()
            .filter(|e| source_id.map_or(true, |s| e.source_id == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.excluded_at.cmp(&b.excluded_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn remove_exclusion(&self, id: &str) -> Result<()> {
        write(&self.exclusions)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("exclusion {id}")))
    }

    async fn delete_exclusions_for_source(&self, source_id: &str) -> Result<usize> {
        let mut exclusions = write(&self.exclusions);
        let before = exclusions.len();
        exclusions.retain(|_, e| e.source_id != source_id);
        Ok(before - exclusions.len())
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCredentialStore {
    /// Keyed by source id; a source holds at most one row.
    credentials: RwLock<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        write(&self.credentials).insert(credentials.source_id.clone(), credentials.clone());
        Ok(())
    }

    async fn get_credentials(&self, id: &str) -> Result<Credentials> {
        read(&self.credentials)
            .values()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("credentials {id}")))
    }

    async fn credentials_for_source(&self, source_id: &str) -> Result<Option<Credentials>> {
        Ok(read(&self.credentials).get(source_id).cloned())
    }

    async fn list_credentials(&self) -> Result<Vec<Credentials>> {
        let mut list: Vec<Credentials> = read(&self.credentials).values().cloned().collect();
        list.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(list)
    }

    async fn delete_credentials_for_source(&self, source_id: &str) -> Result<()> {
        write(&self.credentials).remove(source_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySchedulerStore {
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    /// Oldest first.
    history: RwLock<Vec<TaskResult>>,
}

impl MemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerStore for MemorySchedulerStore {
    async fn get_task(&self, id: &str) -> Result<ScheduledTask> {
        read(&self.tasks)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("task {id}")))
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = read(&self.tasks).values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        write(&self.tasks).insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn record_result(&self, result: &TaskResult) -> Result<()> {
        write(&self.history).push(result.clone());
        Ok(())
    }

    async fn task_history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskResult>> {
        Ok(read(&self.history)
            .iter()
            .rev()
            .filter(|r| r.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn prune_history(&self, keep: usize) -> Result<usize> {
        let mut history = write(&self.history);
        let mut seen: HashMap<String, usize> = HashMap::new();
        let before = history.len();
        let mut kept: Vec<TaskResult> = history
            .iter()
            .rev()
            .filter(|r| {
                let count = seen.entry(r.task_id.clone()).or_insert(0);
                *count += 1;
                *count <= keep
            })
            .cloned()
            .collect();
        kept.reverse();
        *history = kept;
        Ok(before - history.len())
    }
}
