/// Graph-relationship embedding queue: unbounded quadratic retries, high
/// fan-out (default batch/concurrency 200). Mirrors `object_embedding.rs`
/// except for the triplet text-building rule.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::EmbeddingQueueConfig;
use crate::errors::{truncate_error, CoreError};
use crate::jobstore::{self, ClaimQuery};
use crate::queue::{stats_from_rows, JobStatus, QueueAdmin, QueueStats};
use crate::retry::quadratic_backoff;
use crate::services::{EmbeddingService, GraphObject, GraphService};
use crate::worker::{JobProcessor, Outcome};

const TABLE: &str = "relationship_embedding_jobs";

#[derive(Debug, Clone)]
pub struct RelationshipEmbeddingJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub relationship_id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<RelationshipEmbeddingJob, CoreError> {
    let status_str: String = row.try_get("status")?;
    Ok(RelationshipEmbeddingJob {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        relationship_id: row.try_get("relationship_id")?,
        status: JobStatus::from_sql(&status_str)
            .ok_or_else(|| CoreError::Internal(format!("unknown job status: {status_str}")))?,
        priority: row.try_get("priority")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
    })
}

/// `<display(src)> <rel_type> <display(dst)>`, where `display` is the
/// object's `key` if non-empty, else its `type`.
pub fn build_relationship_text(source: &GraphObject, relationship_type: &str, target: &GraphObject) -> String {
    format!(
        "{} {} {}",
        display_name(source),
        relationship_type,
        display_name(target),
    )
}

fn display_name(object: &GraphObject) -> &str {
    match object.key.as_deref() {
        Some(key) if !key.is_empty() => key,
        _ => &object.object_type,
    }
}

pub struct RelationshipEmbeddingQueue {
    pool: PgPool,
    config: EmbeddingQueueConfig,
}

impl RelationshipEmbeddingQueue {
    pub fn new(pool: PgPool, config: EmbeddingQueueConfig) -> Self {
        RelationshipEmbeddingQueue { pool, config }
    }

    pub async fn enqueue(
        &self,
        relationship_id: Uuid,
        project_id: Uuid,
        priority: i32,
        schedule_at: Option<DateTime<Utc>>,
    ) -> Result<RelationshipEmbeddingJob, CoreError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT * FROM relationship_embedding_jobs
             WHERE relationship_id = $1 AND status IN ('pending', 'processing') LIMIT 1",
        )
        .bind(relationship_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return row_to_job(&row);
        }

        let row = sqlx::query(
            "INSERT INTO relationship_embedding_jobs (id, project_id, relationship_id, status, priority, scheduled_at, attempt_count, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', $4, COALESCE($5, now()), 0, now(), now())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(relationship_id)
        .bind(priority)
        .bind(schedule_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        row_to_job(&row)
    }

    pub async fn enqueue_batch(&self, targets: &[(Uuid, Uuid)], priority: i32) -> Result<i64, CoreError> {
        let mut inserted = 0i64;
        for (relationship_id, project_id) in targets {
            let mut tx = self.pool.begin().await?;
            let existing = sqlx::query(
                "SELECT id FROM relationship_embedding_jobs WHERE relationship_id = $1 AND status IN ('pending', 'processing') LIMIT 1",
            )
            .bind(relationship_id)
            .fetch_optional(&mut *tx)
            .await?;
            if existing.is_none() {
                sqlx::query(
                    "INSERT INTO relationship_embedding_jobs (id, project_id, relationship_id, status, priority, scheduled_at, attempt_count, created_at, updated_at)
                     VALUES ($1, $2, $3, 'pending', $4, now(), 0, now(), now())",
                )
                .bind(Uuid::new_v4())
                .bind(project_id)
                .bind(relationship_id)
                .bind(priority)
                .execute(&mut *tx)
                .await?;
                inserted += 1;
            }
            tx.commit().await?;
        }
        Ok(inserted)
    }

    pub async fn dequeue(&self, batch_size: i64) -> Result<Vec<RelationshipEmbeddingJob>, CoreError> {
        let query = ClaimQuery {
            table: TABLE,
            ready_predicate: "status = 'pending' AND scheduled_at <= now()",
            set_clause: "status = 'processing', started_at = now(), attempt_count = attempt_count + 1",
        };
        let rows = jobstore::claim_batch(&self.pool, &query, batch_size, self.config.worker_batch_size).await?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE relationship_embedding_jobs SET status = 'completed', completed_at = now(), last_error = NULL, updated_at = now()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), CoreError> {
        let row = sqlx::query("SELECT attempt_count FROM relationship_embedding_jobs WHERE id = $1 AND status = 'processing'")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(()) };
        let attempt_count: i32 = row.try_get("attempt_count")?;
        let delay = quadratic_backoff(
            attempt_count.max(0) as u32,
            Duration::from_secs(self.config.base_retry_s),
            Duration::from_secs(self.config.max_retry_s),
        );
        sqlx::query(
            "UPDATE relationship_embedding_jobs
             SET status = 'pending', started_at = NULL,
                 scheduled_at = now() + ($2 || ' seconds')::interval,
                 last_error = $3, updated_at = now()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(delay.as_secs().to_string())
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueAdmin for RelationshipEmbeddingQueue {
    async fn stats(&self, project_id: Uuid) -> Result<QueueStats, CoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM relationship_embedding_jobs WHERE project_id = $1 GROUP BY status")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        let rows = rows
            .iter()
            .map(|r| Ok::<_, CoreError>((r.try_get::<String, _>("status")?, r.try_get::<i64, _>("count")?)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats_from_rows(rows))
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE relationship_embedding_jobs SET status = 'cancelled', updated_at = now() WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_cancel(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE relationship_embedding_jobs SET status = 'cancelled', updated_at = now() WHERE project_id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn bulk_retry_failed(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE relationship_embedding_jobs SET status = 'pending', scheduled_at = now(), last_error = NULL, updated_at = now()
             WHERE project_id = $1 AND status = 'failed'",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_completed(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM relationship_embedding_jobs WHERE project_id = $1 AND status = 'completed'")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, threshold_minutes: i64) -> Result<u64, CoreError> {
        jobstore::recover_stale(&self.pool, TABLE, threshold_minutes).await
    }
}

pub struct RelationshipEmbeddingProcessor {
    pub queue: Arc<RelationshipEmbeddingQueue>,
    pub graph: Arc<dyn GraphService>,
    pub embeddings: Arc<dyn EmbeddingService>,
}

#[async_trait]
impl JobProcessor for RelationshipEmbeddingProcessor {
    type Job = RelationshipEmbeddingJob;

    async fn dequeue(&self, batch_size: i64) -> Result<Vec<Self::Job>, CoreError> {
        self.queue.dequeue(batch_size).await
    }

    async fn process(&self, job: Self::Job, cancel: CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let relationship = match self.graph.get_relationship(job.relationship_id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                let _ = self.queue.mark_failed(job.id, "relationship_missing").await;
                return Outcome::Failed;
            }
            Err(e) => {
                let _ = self.queue.mark_failed(job.id, &e.to_string()).await;
                return Outcome::Failed;
            }
        };

        let (source, target) = match (
            self.graph.get_object(relationship.source_id).await,
            self.graph.get_object(relationship.target_id).await,
        ) {
            (Ok(Some(s)), Ok(Some(t))) => (s, t),
            (Ok(None), _) | (_, Ok(None)) => {
                let _ = self.queue.mark_failed(job.id, "relationship_missing").await;
                return Outcome::Failed;
            }
            (Err(e), _) | (_, Err(e)) => {
                let _ = self.queue.mark_failed(job.id, &e.to_string()).await;
                return Outcome::Failed;
            }
        };

        let text = build_relationship_text(&source, &relationship.relationship_type, &target);

        let result = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = self.embeddings.embed(&text) => result,
        };

        match result {
            Ok(embedded) if !embedded.embedding.is_empty() => {
                if let Err(e) = self.graph.patch_relationship_embedding(job.relationship_id, embedded.embedding).await {
                    let _ = self.queue.mark_failed(job.id, &e.to_string()).await;
                    return Outcome::Failed;
                }
                match self.queue.mark_completed(job.id).await {
                    Ok(()) => Outcome::Completed,
                    Err(e) => {
                        warn!(error = %e, "mark_completed failed; row will be recovered as stale");
                        Outcome::Failed
                    }
                }
            }
            Ok(_) => {
                let _ = self.queue.mark_failed(job.id, "no embedding returned").await;
                Outcome::Failed
            }
            Err(e) => {
                let _ = self.queue.mark_failed(job.id, &e.to_string()).await;
                Outcome::Failed
            }
        }
    }

    async fn recover_stale(&self) -> Result<u64, CoreError> {
        self.queue.recover_stale(self.queue.config.stale_threshold_minutes).await
    }

    fn configured_concurrency(&self) -> usize {
        self.queue.config.worker_concurrency
    }

    fn configured_batch_size(&self) -> i64 {
        self.queue.config.worker_batch_size
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.config.worker_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(key: Option<&str>, object_type: &str) -> GraphObject {
        GraphObject {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            object_type: object_type.to_string(),
            key: key.map(str::to_string),
            properties: json!({}),
            embedding: None,
            embedding_updated_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn prefers_key_over_type_for_display() {
        let src = object(Some("alice"), "person");
        let dst = object(None, "company");
        assert_eq!(build_relationship_text(&src, "works_at", &dst), "alice works_at company");
    }

    #[test]
    fn falls_back_to_type_when_key_empty() {
        let src = object(Some(""), "person");
        let dst = object(Some("acme"), "company");
        assert_eq!(build_relationship_text(&src, "works_at", &dst), "person works_at acme");
    }
}
