//! SQLite-backed implementation of every store contract.
//!
//! One [`SqliteStore`] wraps a [`SqlitePool`] and implements the entity
//! stores, the FTS5 [`KeywordIndex`] and the brute-force blob
//! [`VectorIndex`]. Document writes run in a single transaction so a
//! document and its chunks are replaced together or not at all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use sercha_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use sercha_core::models::{
    Chunk, Credentials, Cursor, Document, Exclusion, ScheduledTask, Source, SyncState, TaskResult,
};
use sercha_core::search::tokenize;
use sercha_core::store::{
    ChunkCandidate, CredentialStore, DocumentStore, ExclusionStore, KeywordIndex, SchedulerStore,
    SourceStore, Stores, SyncStateStore, VectorIndex,
};
use sercha_core::{Error, Result};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The entity stores, all backed by this database.
    pub fn stores(self: &Arc<Self>) -> Stores {
        Stores {
            sources: self.clone(),
            documents: self.clone(),
            sync_states: self.clone(),
            exclusions: self.clone(),
            credentials: self.clone(),
        }
    }

    pub async fn document_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(count as usize)
    }
}

fn db(err: sqlx::Error) -> Error {
    Error::Other(anyhow::Error::new(err).context("sqlite"))
}

fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_ts(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

fn opt_ts(nanos: Option<i64>) -> Option<DateTime<Utc>> {
    nanos.map(from_ts)
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let config_json: String = row.get("config_json");
    Ok(Source {
        id: row.get("id"),
        source_type: row.get("source_type"),
        name: row.get("name"),
        config: serde_json::from_str(&config_json)?,
        authorization_id: row.get("authorization_id"),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let metadata_json: String = row.get("metadata_json");
    Ok(Document {
        id: row.get("id"),
        source_id: row.get("source_id"),
        uri: row.get("uri"),
        title: row.get("title"),
        content: row.get("content"),
        parent_id: row.get("parent_id"),
        metadata: serde_json::from_str(&metadata_json)?,
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let metadata_json: String = row.get("metadata_json");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let position: i64 = row.get("position");
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        content: row.get("content"),
        position: position as usize,
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        metadata: serde_json::from_str(&metadata_json)?,
    })
}

fn exclusion_from_row(row: &SqliteRow) -> Exclusion {
    Exclusion {
        id: row.get("id"),
        source_id: row.get("source_id"),
        document_id: row.get("document_id"),
        uri: row.get("uri"),
        reason: row.get("reason"),
        excluded_at: from_ts(row.get("excluded_at")),
    }
}

fn credentials_from_row(row: &SqliteRow) -> Result<Credentials> {
    let secret_json: String = row.get("secret_json");
    Ok(Credentials {
        id: row.get("id"),
        source_id: row.get("source_id"),
        account_identifier: row.get("account_identifier"),
        secret: serde_json::from_str(&secret_json)?,
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

fn task_from_row(row: &SqliteRow) -> ScheduledTask {
    let interval_ms: i64 = row.get("interval_ms");
    ScheduledTask {
        id: row.get("id"),
        name: row.get("name"),
        interval: Duration::from_millis(interval_ms.max(0) as u64),
        enabled: row.get("enabled"),
        last_run: opt_ts(row.get("last_run")),
        next_run: opt_ts(row.get("next_run")),
        last_error: row.get("last_error"),
        last_success: opt_ts(row.get("last_success")),
    }
}

fn result_from_row(row: &SqliteRow) -> TaskResult {
    let items_processed: i64 = row.get("items_processed");
    let items_failed: i64 = row.get("items_failed");
    TaskResult {
        task_id: row.get("task_id"),
        started_at: from_ts(row.get("started_at")),
        ended_at: from_ts(row.get("ended_at")),
        success: row.get("success"),
        error: row.get("error"),
        items_processed: items_processed as usize,
        items_failed: items_failed as usize,
    }
}

/// Delete a document with its chunks and index rows. Returns the number of
/// document rows removed.
async fn purge_document(conn: &mut SqliteConnection, id: &str) -> Result<u64> {
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    let removed = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(removed.rows_affected())
}

fn push_source_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, source_ids: &[String]) {
    if source_ids.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut ids = qb.separated(", ");
    for id in source_ids {
        ids.push_bind(id.clone());
    }
    ids.push_unseparated(")");
}

#[async_trait]
impl SourceStore for SqliteStore {
    async fn save_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, source_type, name, config_json, authorization_id,
                                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_type = excluded.source_type,
                name = excluded.name,
                config_json = excluded.config_json,
                authorization_id = excluded.authorization_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&source.id)
        .bind(&source.source_type)
        .bind(&source.name)
        .bind(serde_json::to_string(&source.config)?)
        .bind(&source.authorization_id)
        .bind(ts(source.created_at))
        .bind(ts(source.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Source> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| Error::not_found(format!("source {id}")))?;
        source_from_row(&row)
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        sqlx::query("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .iter()
            .map(source_from_row)
            .collect()
    }

    async fn delete_source(&self, id: &str) -> Result<()> {
        let removed = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if removed.rows_affected() == 0 {
            return Err(Error::not_found(format!("source {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(stray) = chunks.iter().find(|c| c.document_id != doc.id) {
            return Err(Error::invalid(format!(
                "chunk {} belongs to document {}, not {}",
                stray.id, stray.document_id, doc.id
            )));
        }
        let metadata_json = serde_json::to_string(&doc.metadata)?;

        let mut tx = self.pool.begin().await.map_err(db)?;

        // Another id stored under the same (source, uri) is superseded.
        let superseded: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE source_id = ? AND uri = ? AND id != ?",
        )
        .bind(&doc.source_id)
        .bind(&doc.uri)
        .bind(&doc.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db)?;
        for id in &superseded {
            purge_document(&mut tx, id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_id, uri, title, content, parent_id,
                                   metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                uri = excluded.uri,
                title = excluded.title,
                content = excluded.content,
                parent_id = excluded.parent_id,
                metadata_json = excluded.metadata_json,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_id)
        .bind(&doc.uri)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.parent_id)
        .bind(&metadata_json)
        .bind(ts(doc.created_at))
        .bind(ts(doc.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, position, content, embedding, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.position as i64)
            .bind(&chunk.content)
            .bind(chunk.embedding.as_deref().map(vec_to_blob))
            .bind(serde_json::to_string(&chunk.metadata)?)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, source_id, content) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&doc.source_id)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| Error::not_found(format!("document {id}")))?;
        document_from_row(&row)
    }

    async fn find_by_uri(&self, source_id: &str, uri: &str) -> Result<Option<Document>> {
        sqlx::query("SELECT * FROM documents WHERE source_id = ? AND uri = ?")
            .bind(source_id)
            .bind(uri)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .as_ref()
            .map(document_from_row)
            .transpose()
    }

    async fn list_documents(&self, source_id: &str) -> Result<Vec<Document>> {
        sqlx::query("SELECT * FROM documents WHERE source_id = ? ORDER BY uri")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .iter()
            .map(document_from_row)
            .collect()
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY position ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .iter()
            .map(chunk_from_row)
            .collect()
    }

    async fn get_chunk(&self, id: &str) -> Result<Chunk> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| Error::not_found(format!("chunk {id}")))?;
        chunk_from_row(&row)
    }

    async fn delete_document(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        if purge_document(&mut tx, id).await? == 0 {
            return Err(Error::not_found(format!("document {id}")));
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn delete_documents_for_source(&self, source_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM chunks_fts WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE source_id = ?)",
        )
        .bind(source_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        let removed = sqlx::query("DELETE FROM documents WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(removed.rows_affected() as usize)
    }
}

#[async_trait]
impl SyncStateStore for SqliteStore {
    async fn get_sync_state(&self, source_id: &str) -> Result<SyncState> {
        let row = sqlx::query("SELECT source_id, cursor, last_sync FROM sync_states WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| Error::not_found(format!("sync state for {source_id}")))?;
        let cursor: String = row.get("cursor");
        Ok(SyncState {
            source_id: row.get("source_id"),
            cursor: Cursor::new(cursor),
            last_sync: from_ts(row.get("last_sync")),
        })
    }

    async fn save_sync_state(&self, state: &SyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_states (source_id, cursor, last_sync) VALUES (?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                cursor = excluded.cursor,
                last_sync = excluded.last_sync
            "#,
        )
        .bind(&state.source_id)
        .bind(state.cursor.as_str())
        .bind(ts(state.last_sync))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn delete_sync_state(&self, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_states WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}

#[async_trait]
impl ExclusionStore for SqliteStore {
    async fn add_exclusion(&self, exclusion: &Exclusion) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO exclusions (id, source_id, document_id, uri, reason, excluded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, uri) DO NOTHING
            "#,
        )
        .bind(&exclusion.id)
        .bind(&exclusion.source_id)
        .bind(&exclusion.document_id)
        .bind(&exclusion.uri)
        .bind(&exclusion.reason)
        .bind(ts(exclusion.excluded_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if inserted.rows_affected() == 0 {
            return Err(Error::AlreadyExists(format!(
                "exclusion for {} in source {}",
                exclusion.uri, exclusion.source_id
            )));
        }
        Ok(())
    }

    async fn get_exclusion(&self, id: &str) -> Result<Exclusion> {
        sqlx::query("SELECT * FROM exclusions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .as_ref()
            .map(exclusion_from_row)
            .ok_or_else(|| Error::not_found(format!("exclusion {id}")))
    }

    async fn is_excluded(&self, source_id: &str, uri: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM exclusions WHERE source_id = ? AND uri = ?",
        )
        .bind(source_id)
        .bind(uri)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        Ok(found)
    }

    async fn list_exclusions(&self, source_id: Option<&str>) -> Result<Vec<Exclusion>> {
        let rows = match source_id {
            Some(source_id) => {
                sqlx::query("SELECT * FROM exclusions WHERE source_id = ? ORDER BY excluded_at, id")
                    .bind(source_id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM exclusions ORDER BY excluded_at, id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db)?;
        Ok(rows.iter().map(exclusion_from_row).collect())
    }

    async fn remove_exclusion(&self, id: &str) -> Result<()> {
        let removed = sqlx::query("DELETE FROM exclusions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if removed.rows_affected() == 0 {
            return Err(Error::not_found(format!("exclusion {id}")));
        }
        Ok(())
    }

    async fn delete_exclusions_for_source(&self, source_id: &str) -> Result<usize> {
        let removed = sqlx::query("DELETE FROM exclusions WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(removed.rows_affected() as usize)
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn save_credentials(&self, credentials: &Credentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, source_id, account_identifier, secret_json,
                                     created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                id = excluded.id,
                account_identifier = excluded.account_identifier,
                secret_json = excluded.secret_json,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credentials.id)
        .bind(&credentials.source_id)
        .bind(&credentials.account_identifier)
        .bind(serde_json::to_string(&credentials.secret)?)
        .bind(ts(credentials.created_at))
        .bind(ts(credentials.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_credentials(&self, id: &str) -> Result<Credentials> {
        let row = sqlx::query("SELECT * FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| Error::not_found(format!("credentials {id}")))?;
        credentials_from_row(&row)
    }

    async fn credentials_for_source(&self, source_id: &str) -> Result<Option<Credentials>> {
        sqlx::query("SELECT * FROM credentials WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .as_ref()
            .map(credentials_from_row)
            .transpose()
    }

    async fn list_credentials(&self) -> Result<Vec<Credentials>> {
        sqlx::query("SELECT * FROM credentials ORDER BY source_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?
            .iter()
            .map(credentials_from_row)
            .collect()
    }

    async fn delete_credentials_for_source(&self, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for SqliteStore {
    async fn get_task(&self, id: &str) -> Result<ScheduledTask> {
        sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .as_ref()
            .map(task_from_row)
            .ok_or_else(|| Error::not_found(format!("task {id}")))
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    async fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (id, name, interval_ms, enabled, last_run, next_run,
                                         last_error, last_success)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                interval_ms = excluded.interval_ms,
                enabled = excluded.enabled,
                last_run = excluded.last_run,
                next_run = excluded.next_run,
                last_error = excluded.last_error,
                last_success = excluded.last_success
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(i64::try_from(task.interval.as_millis()).unwrap_or(i64::MAX))
        .bind(task.enabled)
        .bind(task.last_run.map(ts))
        .bind(task.next_run.map(ts))
        .bind(&task.last_error)
        .bind(task.last_success.map(ts))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn record_result(&self, result: &TaskResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_results (task_id, started_at, ended_at, success, error,
                                      items_processed, items_failed)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.task_id)
        .bind(ts(result.started_at))
        .bind(ts(result.ended_at))
        .bind(result.success)
        .bind(&result.error)
        .bind(result.items_processed as i64)
        .bind(result.items_failed as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn task_history(&self, task_id: &str, limit: usize) -> Result<Vec<TaskResult>> {
        let rows = sqlx::query(
            "SELECT * FROM task_results WHERE task_id = ? ORDER BY started_at DESC, seq DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.iter().map(result_from_row).collect())
    }

    async fn prune_history(&self, keep: usize) -> Result<usize> {
        let removed = sqlx::query(
            r#"
            DELETE FROM task_results WHERE seq IN (
                SELECT seq FROM (
                    SELECT seq, ROW_NUMBER() OVER (
                        PARTITION BY task_id ORDER BY started_at DESC, seq DESC
                    ) AS rn
                    FROM task_results
                ) WHERE rn > ?
            )
            "#,
        )
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(removed.rows_affected() as usize)
    }
}

#[async_trait]
impl KeywordIndex for SqliteStore {
    /// BM25 over `chunks_fts`. Query terms are OR-ed phrases, so any term
    /// matches; the score is the negated bm25 rank.
    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        source_ids: &[String],
    ) -> Result<Vec<ChunkCandidate>> {
        let mut terms = tokenize(query);
        terms.dedup();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let match_expr = terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT chunk_id, document_id, bm25(chunks_fts) AS score FROM chunks_fts WHERE chunks_fts MATCH ",
        );
        qb.push_bind(match_expr);
        push_source_filter(&mut qb, "source_id", source_ids);
        qb.push(" ORDER BY score LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;
        Ok(rows
            .iter()
            .map(|row| {
                let score: f64 = row.get("score");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: -score,
                }
            })
            .collect())
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn vector_search(
        &self,
        vector: &[f32],
        limit: usize,
        source_ids: &[String],
    ) -> Result<Vec<ChunkCandidate>> {
        if vector.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT c.id, c.document_id, c.embedding
            FROM chunks c JOIN documents d ON d.id = c.document_id
            WHERE c.embedding IS NOT NULL
            "#,
        );
        push_source_filter(&mut qb, "d.source_id", source_ids);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db)?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let embedding = blob_to_vec(&blob);
                (embedding.len() == vector.len()).then(|| ChunkCandidate {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    raw_score: cosine_similarity(vector, &embedding) as f64,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}
