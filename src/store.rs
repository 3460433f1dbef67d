//! Vector store: persisted content embeddings with similarity search.
//!
//! Each record occupies a `(document, chapter, kind)` slot and is keyed by
//! its content hash, so re-ingesting unchanged text is a no-op and changed
//! text replaces the slot's previous record. Searches scan the (single-node
//! sized) index, score by cosine similarity, and rank deterministically.
//!
//! The store does not own cache invalidation. It publishes touched document
//! ids on a broadcast change feed; the search cache subscribes to it.

use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;

use crate::error::{ResolveError, Result};
use crate::models::{ContentKind, EmbeddingRecord, NewEmbedding, Scope};
use crate::text;
use crate::vectors;

/// Outcome of an upsert: the record id, and whether a row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    pub inserted: bool,
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    touched: broadcast::Sender<String>,
}

impl VectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (touched, _) = broadcast::channel(64);
        Self { pool, touched }
    }

    /// Subscribe to the touched-document change feed. An id is published
    /// whenever an upsert writes or a delete removes records for a document.
    pub fn touched(&self) -> broadcast::Receiver<String> {
        self.touched.subscribe()
    }

    /// Insert a content embedding, idempotently.
    ///
    /// If the slot already holds a record with the same content hash, the
    /// existing id is returned and nothing is written. If the slot holds
    /// records with a different hash, the content changed: the stale rows
    /// are removed and the new record replaces them.
    pub async fn upsert(&self, new: &NewEmbedding) -> Result<Upserted> {
        let content_hash = text::content_hash(&new.content_text);
        let normalized_hash = text::normalized_hash(&new.content_text);

        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM embedding_records
            WHERE document_id = ? AND chapter_id IS ? AND content_kind = ? AND content_hash = ?
            "#,
        )
        .bind(&new.document_id)
        .bind(&new.chapter_id)
        .bind(new.content_kind.as_str())
        .bind(&content_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = existing {
            return Ok(Upserted {
                id,
                inserted: false,
            });
        }

        let mut tx = self.pool.begin().await?;

        // Content changed for this slot: drop the superseded record(s).
        sqlx::query(
            r#"
            DELETE FROM embedding_records
            WHERE document_id = ? AND chapter_id IS ? AND content_kind = ? AND content_hash != ?
            "#,
        )
        .bind(&new.document_id)
        .bind(&new.chapter_id)
        .bind(new.content_kind.as_str())
        .bind(&content_hash)
        .execute(&mut *tx)
        .await?;

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO embedding_records
                (document_id, chapter_id, content_kind, content_hash, normalized_hash,
                 content_text, content_summary, embedding, model, dims, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.document_id)
        .bind(&new.chapter_id)
        .bind(new.content_kind.as_str())
        .bind(&content_hash)
        .bind(&normalized_hash)
        .bind(&new.content_text)
        .bind(&new.content_summary)
        .bind(vectors::vec_to_blob(&new.vector))
        .bind(&new.model)
        .bind(new.vector.len() as i64)
        .bind(new.metadata.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let id = result.last_insert_rowid();
        let _ = self.touched.send(new.document_id.clone());
        tracing::debug!(document_id = %new.document_id, id, "embedding record written");

        Ok(Upserted { id, inserted: true })
    }

    /// Cosine similarity search.
    ///
    /// Returns up to `top_k` records with score `>= min_score`, ordered by
    /// score descending with ties broken by lower id (insertion order). An
    /// empty index for the scope yields an empty result, not an error; a
    /// dimensionality mismatch between the query and any stored vector
    /// fails with [`ResolveError::DimensionMismatch`].
    pub async fn search(
        &self,
        query_vector: &[f32],
        scope: Option<&Scope>,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<(EmbeddingRecord, f32)>> {
        let rows = sqlx::query("SELECT * FROM embedding_records")
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<(EmbeddingRecord, f32)> = Vec::new();
        for row in &rows {
            let record = record_from_row(row)?;
            if let Some(scope) = scope {
                if !scope.contains(&record.document_id) {
                    continue;
                }
            }
            if record.dims != query_vector.len() {
                return Err(ResolveError::DimensionMismatch {
                    expected: record.dims,
                    actual: query_vector.len(),
                });
            }
            let score = vectors::cosine_similarity(query_vector, &record.vector);
            if score >= min_score {
                scored.push((record, score));
            }
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        scored.truncate(top_k);

        Ok(scored)
    }

    /// Look up content whose normalized form matches the given text exactly.
    ///
    /// On multiple matches the oldest record (lowest id) wins.
    pub async fn exact_match(
        &self,
        requirement_text: &str,
        scope: Option<&Scope>,
    ) -> Result<Option<EmbeddingRecord>> {
        let hash = text::normalized_hash(requirement_text);
        let rows = sqlx::query(
            "SELECT * FROM embedding_records WHERE normalized_hash = ? ORDER BY id ASC",
        )
        .bind(&hash)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let record = record_from_row(row)?;
            if let Some(scope) = scope {
                if !scope.contains(&record.document_id) {
                    continue;
                }
            }
            return Ok(Some(record));
        }

        Ok(None)
    }

    /// Fetch records by id, preserving the input order. Ids that no longer
    /// exist (deleted documents) are silently skipped.
    pub async fn get_records(&self, ids: &[i64]) -> Result<Vec<EmbeddingRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT * FROM embedding_records WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                records.push(record_from_row(&row)?);
            }
        }
        Ok(records)
    }

    /// Delete all records for a document, publishing a change-feed event.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embedding_records WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            let _ = self.touched.send(document_id.to_string());
            tracing::debug!(document_id, deleted, "embedding records deleted");
        }
        Ok(deleted)
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EmbeddingRecord> {
    let blob: Vec<u8> = row.get("embedding");
    let metadata_json: String = row.get("metadata_json");
    let content_kind: String = row.get("content_kind");
    let dims: i64 = row.get("dims");

    Ok(EmbeddingRecord {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chapter_id: row.get("chapter_id"),
        content_kind: ContentKind::parse(&content_kind)?,
        content_hash: row.get("content_hash"),
        normalized_hash: row.get("normalized_hash"),
        content_text: row.get("content_text"),
        content_summary: row.get("content_summary"),
        vector: vectors::blob_to_vec(&blob),
        model: row.get("model"),
        dims: dims as usize,
        metadata: serde_json::from_str(&metadata_json)?,
    })
}
