//! Batch task tracking and execution.
//!
//! A task is a persisted batch of requirements plus a status row that
//! observers poll. Execution fans the batch out over a bounded worker pool;
//! each finished requirement is written together with a `processed_count`
//! bump in one transaction, so progress reads are never ahead of the
//! results that back them.
//!
//! Status transitions are monotonic, enforced by guarded updates: a task
//! that has completed stays completed no matter how often `run` is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::error::{ResolveError, Result};
use crate::models::{
    AnalysisResult, AnalysisTask, MatchType, Requirement, Scope, SourceType, TaskStatus,
};
use crate::resolve::{Resolution, Resolver};

/// Cooperative cancellation flag. Cancelling stops new requirements from
/// being dispatched; in-flight workers run to completion and their results
/// are kept.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TaskTracker {
    pool: SqlitePool,
    resolver: Arc<Resolver>,
    policy: PolicyConfig,
}

impl TaskTracker {
    pub fn new(pool: SqlitePool, resolver: Arc<Resolver>, policy: PolicyConfig) -> Self {
        Self {
            pool,
            resolver,
            policy,
        }
    }

    /// Persist a new pending task and its requirement batch, returning the
    /// task id.
    pub async fn create_task(
        &self,
        user_id: &str,
        filename: Option<&str>,
        requirements: &[Requirement],
    ) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO analysis_tasks
                (id, user_id, filename, total_requirements, processed_count, status, created_at)
            VALUES (?, ?, ?, ?, 0, 'pending', ?)
            "#,
        )
        .bind(&task_id)
        .bind(user_id)
        .bind(filename)
        .bind(requirements.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (index, requirement) in requirements.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO task_requirements (task_id, requirement_index, title, content)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&task_id)
            .bind(index as i64)
            .bind(&requirement.title)
            .bind(&requirement.content)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(%task_id, count = requirements.len(), "task created");
        Ok(task_id)
    }

    /// Execute a pending task to a terminal state.
    ///
    /// Calling `run` on a task that is not pending is a no-op: the guarded
    /// `pending -> processing` transition claims the task exactly once.
    pub async fn run(
        &self,
        task_id: &str,
        scope: Option<&Scope>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let claimed = sqlx::query(
            "UPDATE analysis_tasks SET status = 'processing' WHERE id = ? AND status = 'pending'",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 0 {
            let task = self.get_task(task_id).await?;
            tracing::warn!(%task_id, status = task.status.as_str(), "task not pending, skipping");
            return Ok(());
        }

        // Past the claim the task must reach a terminal state: a storage
        // failure before any dispatch fails it rather than stranding it
        // in `processing`.
        let requirements = match self.load_requirements(task_id).await {
            Ok(requirements) => requirements,
            Err(e) => {
                let _ = self
                    .mark_failed(task_id, &format!("storage failure before dispatch: {e}"))
                    .await;
                return Err(e);
            }
        };
        let total = requirements.len();
        tracing::info!(%task_id, total, "task started");

        let semaphore = Arc::new(Semaphore::new(self.policy.concurrency));
        let mut join_set: JoinSet<(usize, Requirement, Resolution)> = JoinSet::new();
        let mut cancelled = false;

        for (index, requirement) in requirements.into_iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ResolveError::config("worker pool closed"))?;
            let resolver = Arc::clone(&self.resolver);
            let scope = scope.cloned();

            join_set.spawn(async move {
                let resolution = resolver.resolve(&requirement.content, scope.as_ref()).await;
                drop(permit);
                (index, requirement, resolution)
            });
        }

        let mut consecutive_storage_failures = 0u32;
        while let Some(joined) = join_set.join_next().await {
            let Ok((index, requirement, resolution)) = joined else {
                // A panicked worker loses its result; the backfill below
                // records the gap as unresolved.
                tracing::warn!(%task_id, "requirement worker panicked");
                continue;
            };

            match self
                .write_result(task_id, index, &requirement, &resolution)
                .await
            {
                Ok(()) => consecutive_storage_failures = 0,
                Err(e) => {
                    consecutive_storage_failures += 1;
                    tracing::warn!(%task_id, index, error = %e,
                        failures = consecutive_storage_failures, "result write failed");
                    if consecutive_storage_failures
                        >= self.policy.max_consecutive_storage_failures
                    {
                        join_set.abort_all();
                        self.mark_failed(task_id, "persistent storage failure")
                            .await?;
                        return Ok(());
                    }
                }
            }
        }

        if cancelled {
            self.mark_failed(task_id, "cancelled").await?;
            tracing::info!(%task_id, "task cancelled");
            return Ok(());
        }

        self.backfill_missing(task_id, total).await?;

        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE analysis_tasks SET status = 'completed', completed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(%task_id, total, "task completed");
        Ok(())
    }

    /// Current task row.
    pub async fn get_task(&self, task_id: &str) -> Result<AnalysisTask> {
        let row = sqlx::query("SELECT * FROM analysis_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ResolveError::not_found("task", task_id))?;

        task_from_row(&row)
    }

    /// All results for a task, ordered by requirement index.
    pub async fn get_results(&self, task_id: &str) -> Result<Vec<AnalysisResult>> {
        let rows = sqlx::query(
            "SELECT * FROM analysis_results WHERE task_id = ? ORDER BY requirement_index ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }

    async fn load_requirements(&self, task_id: &str) -> Result<Vec<Requirement>> {
        let rows = sqlx::query(
            r#"
            SELECT title, content FROM task_requirements
            WHERE task_id = ? ORDER BY requirement_index ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Requirement {
                title: row.get("title"),
                content: row.get("content"),
            })
            .collect())
    }

    /// Persist one result and bump progress atomically. The index-keyed
    /// unique constraint makes replays harmless.
    async fn write_result(
        &self,
        task_id: &str,
        index: usize,
        requirement: &Requirement,
        resolution: &Resolution,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO analysis_results
                (task_id, requirement_index, requirement_title, requirement_content,
                 answer, match_type, confidence, source_type, source_info, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id)
        .bind(index as i64)
        .bind(&requirement.title)
        .bind(&requirement.content)
        .bind(&resolution.answer)
        .bind(resolution.match_type.as_str())
        .bind(resolution.confidence)
        .bind(resolution.source_type.map(|s| s.as_str()))
        .bind(resolution.source_info.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() > 0 {
            sqlx::query(
                "UPDATE analysis_tasks SET processed_count = processed_count + 1 WHERE id = ?",
            )
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Record an unresolved result for every index that lost its worker, so
    /// a completed task always has a dense `[0, total)` result set.
    async fn backfill_missing(&self, task_id: &str, total: usize) -> Result<()> {
        let rows = sqlx::query(
            "SELECT requirement_index FROM analysis_results WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        let written: std::collections::HashSet<i64> =
            rows.iter().map(|row| row.get("requirement_index")).collect();
        if written.len() == total {
            return Ok(());
        }

        let requirements = self.load_requirements(task_id).await?;
        for index in 0..total as i64 {
            if written.contains(&index) {
                continue;
            }
            let requirement = requirements
                .get(index as usize)
                .cloned()
                .unwrap_or_else(|| Requirement::from_content(""));
            let resolution = Resolution {
                answer: String::new(),
                match_type: MatchType::None,
                confidence: 0.0,
                source_type: None,
                source_info: serde_json::json!({ "failures": ["worker failed"] }),
            };
            self.write_result(task_id, index as usize, &requirement, &resolution)
                .await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, task_id: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE analysis_tasks SET status = 'failed', error_message = ?, completed_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AnalysisTask> {
    let status: String = row.get("status");
    Ok(AnalysisTask {
        id: row.get("id"),
        user_id: row.get("user_id"),
        filename: row.get("filename"),
        total_requirements: row.get("total_requirements"),
        processed_count: row.get("processed_count"),
        status: TaskStatus::parse(&status)?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

fn result_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AnalysisResult> {
    let match_type: String = row.get("match_type");
    let source_type: Option<String> = row.get("source_type");
    let source_info: String = row.get("source_info");

    Ok(AnalysisResult {
        id: row.get("id"),
        task_id: row.get("task_id"),
        requirement_index: row.get("requirement_index"),
        requirement_title: row.get("requirement_title"),
        requirement_content: row.get("requirement_content"),
        answer: row.get("answer"),
        match_type: MatchType::parse(&match_type)?,
        confidence: row.get("confidence"),
        source_type: source_type.as_deref().map(SourceType::parse).transpose()?,
        source_info: serde_json::from_str(&source_info)?,
    })
}
