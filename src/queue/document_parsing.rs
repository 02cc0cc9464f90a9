/// Document parsing queue: bounded exponential retries, extension/MIME
/// routing, dead-letter on retry exhaustion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::DocumentParsingConfig;
use crate::errors::{truncate_error, CoreError};
use crate::jobstore::{self, ClaimQuery};
use crate::queue::{stats_from_rows, JobStatus, QueueAdmin, QueueStats};
use crate::retry::exponential_backoff;
use crate::services::{DocumentExtractionService, DocumentService, ExtractOpts, StorageService, TranscriptionService};
use crate::worker::{JobProcessor, Outcome};

const TABLE: &str = "document_parsing_jobs";
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac", "aac", "opus", "webm"];

#[derive(Debug, Clone)]
pub struct DocumentParsingJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub document_id: Uuid,
    pub storage_key: String,
    pub mime: String,
    pub filename: String,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<DocumentParsingJob, CoreError> {
    let status_str: String = row.try_get("status")?;
    Ok(DocumentParsingJob {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        document_id: row.try_get("document_id")?,
        storage_key: row.try_get("storage_key")?,
        mime: row.try_get("mime")?,
        filename: row.try_get("filename")?,
        status: JobStatus::from_sql(&status_str)
            .ok_or_else(|| CoreError::Internal(format!("unknown job status: {status_str}")))?,
        priority: row.try_get("priority")?,
        scheduled_at: row.try_get("scheduled_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
    })
}

pub fn is_audio(mime: &str, filename: &str) -> bool {
    if mime.starts_with("audio/") {
        return true;
    }
    filename
        .rsplit_once('.')
        .map(|(_, ext)| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct DocumentParsingQueue {
    pool: PgPool,
    config: DocumentParsingConfig,
}

impl DocumentParsingQueue {
    pub fn new(pool: PgPool, config: DocumentParsingConfig) -> Self {
        DocumentParsingQueue { pool, config }
    }

    pub async fn enqueue(
        &self,
        document_id: Uuid,
        project_id: Uuid,
        storage_key: &str,
        mime: &str,
        filename: &str,
        priority: i32,
        max_retries: Option<i32>,
    ) -> Result<DocumentParsingJob, CoreError> {
        let row = sqlx::query(
            "INSERT INTO document_parsing_jobs
                (id, project_id, document_id, storage_key, mime, filename, status, priority, scheduled_at, retry_count, max_retries, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, now(), 0, $8, now(), now())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(project_id)
        .bind(document_id)
        .bind(storage_key)
        .bind(mime)
        .bind(filename)
        .bind(priority)
        .bind(max_retries.unwrap_or(self.config.default_max_retries as i32))
        .fetch_one(&self.pool)
        .await?;
        row_to_job(&row)
    }

    pub async fn dequeue(&self, batch_size: i64) -> Result<Vec<DocumentParsingJob>, CoreError> {
        let query = ClaimQuery {
            table: TABLE,
            ready_predicate:
                "(status = 'pending' AND scheduled_at <= now()) OR (status = 'retry_pending' AND next_retry_at <= now())",
            set_clause: "status = 'processing', started_at = now()",
        };
        let rows = jobstore::claim_batch(&self.pool, &query, batch_size, self.config.worker_batch_size).await?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE document_parsing_jobs
             SET status = 'completed', completed_at = now(), last_error = NULL, updated_at = now()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `retryable = false` short-circuits straight to `dead_letter` on first
    /// failure (used for the known-unsupported "email parsing" case so it
    /// doesn't burn the whole retry budget).
    pub async fn mark_failed(&self, id: Uuid, error: &str, retryable: bool) -> Result<(), CoreError> {
        let row = sqlx::query(
            "SELECT retry_count, max_retries FROM document_parsing_jobs WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(()) };
        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;
        let new_retry_count = retry_count + 1;

        if !retryable || new_retry_count >= max_retries {
            sqlx::query(
                "UPDATE document_parsing_jobs
                 SET status = 'dead_letter', retry_count = $2, started_at = NULL, last_error = $3, updated_at = now()
                 WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(new_retry_count)
            .bind(truncate_error(error))
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let delay = exponential_backoff(
            retry_count.max(0) as u32,
            Duration::from_millis(self.config.base_retry_ms),
            self.config.retry_multiplier,
            Duration::from_millis(self.config.max_retry_ms),
        );

        sqlx::query(
            "UPDATE document_parsing_jobs
             SET status = 'retry_pending', retry_count = $2, started_at = NULL,
                 next_retry_at = now() + ($3 || ' milliseconds')::interval,
                 last_error = $4, updated_at = now()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(new_retry_count)
        .bind(delay.as_millis().to_string())
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueAdmin for DocumentParsingQueue {
    async fn stats(&self, project_id: Uuid) -> Result<QueueStats, CoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM document_parsing_jobs WHERE project_id = $1 GROUP BY status")
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
            "UPDATE document_parsing_jobs SET status = 'cancelled', updated_at = now()
             WHERE id = $1 AND status IN ('pending', 'processing', 'retry_pending')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_cancel(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE document_parsing_jobs SET status = 'cancelled', updated_at = now()
             WHERE project_id = $1 AND status IN ('pending', 'processing', 'retry_pending')",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn bulk_retry_failed(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE document_parsing_jobs
             SET status = 'pending', scheduled_at = now(), retry_count = 0, last_error = NULL, updated_at = now()
             WHERE project_id = $1 AND status IN ('dead_letter', 'failed')",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_completed(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM document_parsing_jobs WHERE project_id = $1 AND status = 'completed'")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, threshold_minutes: i64) -> Result<u64, CoreError> {
        jobstore::recover_stale(&self.pool, TABLE, threshold_minutes).await
    }
}

pub struct DocumentParsingProcessor {
    pub queue: Arc<DocumentParsingQueue>,
    pub documents: Arc<dyn DocumentService>,
    pub storage: Arc<dyn StorageService>,
    pub transcription: Arc<dyn TranscriptionService>,
    pub extraction: Arc<dyn DocumentExtractionService>,
    pub initial_prompt_for_project: Arc<dyn Fn(Uuid) -> Option<String> + Send + Sync>,
}

#[async_trait]
impl JobProcessor for DocumentParsingProcessor {
    type Job = DocumentParsingJob;

    async fn dequeue(&self, batch_size: i64) -> Result<Vec<Self::Job>, CoreError> {
        self.queue.dequeue(batch_size).await
    }

    async fn process(&self, job: Self::Job, cancel: CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        if self.extraction.is_email(&job.mime, &job.filename) {
            let _ = self
                .queue
                .mark_failed(job.id, "email parsing is not supported", false)
                .await;
            return Outcome::Failed;
        }

        let bytes = match tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = self.storage.download(&job.storage_key) => result,
        } {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = self.queue.mark_failed(job.id, &e.to_string(), true).await;
                return Outcome::Failed;
            }
        };

        let content = if is_audio(&job.mime, &job.filename) {
            if let Some(max_size) = self.transcription.max_file_size_bytes() {
                if bytes.len() as u64 > max_size {
                    let _ = self
                        .queue
                        .mark_failed(job.id, "audio file exceeds transcription size limit", true)
                        .await;
                    return Outcome::Failed;
                }
            }
            let prompt = (self.initial_prompt_for_project)(job.project_id);
            let result = tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                result = self.transcription.transcribe(&bytes, &job.filename, &job.mime, prompt.as_deref()) => result,
            };
            match result {
                Ok(text) => text,
                Err(e) => {
                    let _ = self.queue.mark_failed(job.id, &e.to_string(), true).await;
                    return Outcome::Failed;
                }
            }
        } else if self.extraction.should_use(&job.mime, &job.filename) {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                result = self.extraction.extract(&bytes, &job.filename, &job.mime, ExtractOpts { ocr_auto_detect: true }) => result,
            };
            match result {
                Ok(extracted) => extracted.content,
                Err(e) => {
                    let _ = self.queue.mark_failed(job.id, &e.to_string(), true).await;
                    return Outcome::Failed;
                }
            }
        } else {
            match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    let _ = self.queue.mark_failed(job.id, &e.to_string(), true).await;
                    return Outcome::Failed;
                }
            }
        };

        if let Err(e) = self.documents.set_parsed_content(job.document_id, content).await {
            let _ = self.queue.mark_failed(job.id, &e.to_string(), true).await;
            return Outcome::Failed;
        }

        match self.queue.mark_completed(job.id).await {
            Ok(()) => {
                if let Err(e) = self.documents.enqueue_chunk_creation(job.document_id).await {
                    warn!(document_id = %job.document_id, error = %e, "chunk creation enqueue failed after parse completed");
                }
                Outcome::Completed
            }
            Err(e) => {
                warn!(error = %e, "mark_completed failed; row will be recovered as stale");
                Outcome::Failed
            }
        }
    }

    async fn recover_stale(&self) -> Result<u64, CoreError> {
        self.queue
            .recover_stale(self.queue.config.stale_threshold_minutes)
            .await
    }

    fn configured_concurrency(&self) -> usize {
        // Parsing has no adaptive-scaling config of its own; run the whole
        // claimed batch concurrently and let `worker_batch_size` be the
        // only throttle.
        self.queue.config.worker_batch_size.max(1) as usize
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

    #[test]
    fn audio_detected_by_mime_prefix() {
        assert!(is_audio("audio/mpeg", "clip.bin"));
    }

    #[test]
    fn audio_detected_by_extension() {
        assert!(is_audio("application/octet-stream", "voicemail.m4a"));
        assert!(!is_audio("application/octet-stream", "report.pdf"));
    }
}
