//! Search cache: memoized similarity rankings with TTL and hit counting.
//!
//! Vector search and especially the web/LLM fallback tiers are expensive,
//! and requirement batches routinely re-ask near-identical questions. The
//! cache keys on the hash of the normalized query plus the canonical scope,
//! trading perfect precision for an O(1) lookup, and stores the full ranked
//! candidate list so the ranking survives later threshold changes.
//!
//! Entries are inert once expired: an expired hit is treated as a miss and
//! the stale row is replaced by the next `put`, never reused. Invalidation
//! is driven by the vector store's touched-document feed.

use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::{CacheEntry, EmbeddingRecord, Scope};
use crate::text;
use crate::vectors;

#[derive(Clone)]
pub struct SearchCache {
    pool: SqlitePool,
}

impl SearchCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up a cached ranking. A live hit increments `hit_count`; an
    /// expired hit deletes the stale row and reports a miss.
    pub async fn get(&self, query_text: &str, scope: Option<&Scope>) -> Result<Option<CacheEntry>> {
        self.get_at(query_text, scope, chrono::Utc::now().timestamp())
            .await
    }

    /// [`get`](Self::get) with an explicit clock, for deterministic tests.
    pub async fn get_at(
        &self,
        query_text: &str,
        scope: Option<&Scope>,
        now: i64,
    ) -> Result<Option<CacheEntry>> {
        let hash = text::query_hash(query_text, scope);

        let row = sqlx::query("SELECT * FROM search_cache WHERE query_hash = ?")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: i64 = row.get("expires_at");
        if now > expires_at {
            sqlx::query("DELETE FROM search_cache WHERE query_hash = ?")
                .bind(&hash)
                .execute(&self.pool)
                .await?;
            tracing::debug!(%hash, "stale cache entry dropped");
            return Ok(None);
        }

        sqlx::query("UPDATE search_cache SET hit_count = hit_count + 1 WHERE query_hash = ?")
            .bind(&hash)
            .execute(&self.pool)
            .await?;

        let mut entry = entry_from_row(&row)?;
        entry.hit_count += 1;
        Ok(Some(entry))
    }

    /// Store a ranking for a query. Upsert keyed by the query hash;
    /// last write wins on concurrent puts, which is acceptable because
    /// entries are derived, re-computable data.
    pub async fn put(
        &self,
        query_text: &str,
        scope: Option<&Scope>,
        query_vector: Option<&[f32]>,
        results: &[(EmbeddingRecord, f32)],
        ttl_secs: i64,
    ) -> Result<()> {
        self.put_at(
            query_text,
            scope,
            query_vector,
            results,
            ttl_secs,
            chrono::Utc::now().timestamp(),
        )
        .await
    }

    /// [`put`](Self::put) with an explicit clock, for deterministic tests.
    pub async fn put_at(
        &self,
        query_text: &str,
        scope: Option<&Scope>,
        query_vector: Option<&[f32]>,
        results: &[(EmbeddingRecord, f32)],
        ttl_secs: i64,
        now: i64,
    ) -> Result<()> {
        let hash = text::query_hash(query_text, scope);

        let ids: Vec<i64> = results.iter().map(|(r, _)| r.id).collect();
        let scores: Vec<f32> = results.iter().map(|(_, s)| *s).collect();
        let mut documents: Vec<&str> =
            results.iter().map(|(r, _)| r.document_id.as_str()).collect();
        documents.sort_unstable();
        documents.dedup();

        sqlx::query(
            r#"
            INSERT INTO search_cache
                (query_hash, query_text, query_vector, scope, result_ids, result_scores,
                 result_documents, hit_count, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(query_hash) DO UPDATE SET
                query_text = excluded.query_text,
                query_vector = excluded.query_vector,
                scope = excluded.scope,
                result_ids = excluded.result_ids,
                result_scores = excluded.result_scores,
                result_documents = excluded.result_documents,
                hit_count = 0,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&hash)
        .bind(query_text)
        .bind(query_vector.map(vectors::vec_to_blob))
        .bind(scope.map(|s| s.key()))
        .bind(serde_json::to_string(&ids)?)
        .bind(serde_json::to_string(&scores)?)
        .bind(serde_json::to_string(&documents)?)
        .bind(now)
        .bind(now + ttl_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove every entry whose cached ranking references the document.
    /// Triggered by the vector store's change feed.
    pub async fn invalidate_document(&self, document_id: &str) -> Result<u64> {
        let rows = sqlx::query("SELECT query_hash, result_documents FROM search_cache")
            .fetch_all(&self.pool)
            .await?;

        let mut removed = 0u64;
        for row in &rows {
            let documents_json: String = row.get("result_documents");
            let documents: Vec<String> = serde_json::from_str(&documents_json)?;
            if documents.iter().any(|d| d == document_id) {
                let hash: String = row.get("query_hash");
                let result = sqlx::query("DELETE FROM search_cache WHERE query_hash = ?")
                    .bind(&hash)
                    .execute(&self.pool)
                    .await?;
                removed += result.rows_affected();
            }
        }

        if removed > 0 {
            tracing::debug!(document_id, removed, "cache entries invalidated");
        }
        Ok(removed)
    }

    /// Drop all expired entries.
    pub async fn sweep(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_cache WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Subscribe the cache to a vector store's touched-document feed.
///
/// Runs until the feed's sender is dropped. If the subscriber lags behind
/// the feed, skipped document ids cannot be recovered individually, so the
/// expired-entry sweep is relied on as the backstop.
pub fn spawn_invalidator(
    cache: SearchCache,
    mut touched: broadcast::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match touched.recv().await {
                Ok(document_id) => {
                    if let Err(e) = cache.invalidate_document(&document_id).await {
                        tracing::warn!(%document_id, error = %e, "cache invalidation failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "cache invalidator lagged behind change feed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CacheEntry> {
    let ids_json: String = row.get("result_ids");
    let scores_json: String = row.get("result_scores");
    let vector_blob: Option<Vec<u8>> = row.get("query_vector");

    Ok(CacheEntry {
        query_hash: row.get("query_hash"),
        query_text: row.get("query_text"),
        query_vector: vector_blob.map(|b| vectors::blob_to_vec(&b)),
        scope: row.get("scope"),
        result_ids: serde_json::from_str(&ids_json)?,
        result_scores: serde_json::from_str(&scores_json)?,
        hit_count: row.get("hit_count"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}
