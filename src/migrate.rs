use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Provider configurations (credentials stay in the environment;
    // credentials_ref names the variable).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            credentials_ref TEXT,
            model TEXT,
            params_json TEXT NOT NULL DEFAULT '{}',
            dims INTEGER,
            is_default INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            UNIQUE(kind, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content embeddings, one row per (document, chapter, kind, content hash).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            chapter_id TEXT,
            content_kind TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            normalized_hash TEXT NOT NULL,
            content_text TEXT NOT NULL,
            content_summary TEXT,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_embedding_slot
        ON embedding_records(document_id, COALESCE(chapter_id, ''), content_kind, content_hash)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_normalized ON embedding_records(normalized_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_document ON embedding_records(document_id)",
    )
    .execute(pool)
    .await?;

    // Cached search rankings. result_documents records the distinct document
    // ids in the ranking so invalidation needs no join.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_cache (
            query_hash TEXT PRIMARY KEY,
            query_text TEXT NOT NULL,
            query_vector BLOB,
            scope TEXT,
            result_ids TEXT NOT NULL,
            result_scores TEXT NOT NULL,
            result_documents TEXT NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_expires ON search_cache(expires_at)")
        .execute(pool)
        .await?;

    // Analysis tasks and their requirement batches.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_tasks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            filename TEXT,
            total_requirements INTEGER NOT NULL,
            processed_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_requirements (
            task_id TEXT NOT NULL,
            requirement_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            PRIMARY KEY (task_id, requirement_index),
            FOREIGN KEY (task_id) REFERENCES analysis_tasks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            requirement_index INTEGER NOT NULL,
            requirement_title TEXT NOT NULL,
            requirement_content TEXT NOT NULL,
            answer TEXT NOT NULL DEFAULT '',
            match_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            source_type TEXT,
            source_info TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(task_id, requirement_index),
            FOREIGN KEY (task_id) REFERENCES analysis_tasks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
