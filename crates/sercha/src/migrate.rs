use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Timestamps are stored as Unix nanoseconds, intervals as milliseconds.
const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        source_type TEXT NOT NULL,
        name TEXT NOT NULL,
        config_json TEXT NOT NULL DEFAULT '{}',
        authorization_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        uri TEXT NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        parent_id TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(source_id, uri)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        UNIQUE(document_id, position),
        FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_states (
        source_id TEXT PRIMARY KEY,
        cursor TEXT NOT NULL,
        last_sync INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS exclusions (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        document_id TEXT NOT NULL,
        uri TEXT NOT NULL,
        reason TEXT NOT NULL,
        excluded_at INTEGER NOT NULL,
        UNIQUE(source_id, uri)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL UNIQUE,
        account_identifier TEXT,
        secret_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        interval_ms INTEGER NOT NULL,
        enabled INTEGER NOT NULL,
        last_run INTEGER,
        next_run INTEGER,
        last_error TEXT,
        last_success INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_results (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER NOT NULL,
        success INTEGER NOT NULL,
        error TEXT,
        items_processed INTEGER NOT NULL,
        items_failed INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_id)",
    "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_results_task ON task_results(task_id, started_at DESC)",
];

/// Create every table and index. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .context("Failed to create table")?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                source_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create chunks_fts")?;
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
