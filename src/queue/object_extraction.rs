/// Object-extraction queue: bounded exponential retries, dead-letter on
/// exhaustion, one-at-a-time dequeue (the pipeline call itself is the
/// expensive unit of work, not a batch of rows).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::ExtractionQueueConfig;
use crate::errors::{truncate_error, CoreError};
use crate::extraction::pipeline::ExtractionPipeline;
use crate::extraction::schema::SchemaProvider;
use crate::extraction::SourceSelector;
use crate::jobstore::{self, ClaimQuery};
use crate::queue::{stats_from_rows, JobStatus, QueueAdmin, QueueStats};
use crate::retry::exponential_backoff;
use crate::services::{DocumentService, ModelFactory, NewGraphObject, NewGraphRelationship};
use crate::worker::{JobProcessor, Outcome};

const TABLE: &str = "object_extraction_jobs";

#[derive(Debug, Clone)]
pub struct ObjectExtractionJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source: SourceSelector,
    pub enabled_types: Vec<String>,
    pub extraction_config: Value,
    pub status: JobStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub discovered_types: Vec<String>,
    pub objects_created: i64,
    pub relationships_created: i64,
    pub processed_items: i64,
    pub total_items: i64,
}

#[derive(Debug, Clone)]
pub struct CreateExtractionJobOptions {
    pub project_id: Uuid,
    pub source: SourceSelector,
    pub enabled_types: Vec<String>,
    pub extraction_config: Value,
    pub created_by: Uuid,
    pub priority: i32,
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<ObjectExtractionJob, CoreError> {
    let status_str: String = row.try_get("status")?;
    let source_type: String = row.try_get("source_type")?;
    let source = match source_type.as_str() {
        "document" => SourceSelector::Document(row.try_get("source_document_id")?),
        "chunk" => SourceSelector::Chunk(row.try_get("source_chunk_id")?),
        "manual" => SourceSelector::Manual(row.try_get("source_text")?),
        other => return Err(CoreError::Internal(format!("unknown source_type: {other}"))),
    };
    let enabled_types: Value = row.try_get("enabled_types")?;
    let enabled_types: Vec<String> = serde_json::from_value(enabled_types).unwrap_or_default();
    let discovered_types: Value = row.try_get("discovered_types")?;
    let discovered_types: Vec<String> = serde_json::from_value(discovered_types).unwrap_or_default();

    Ok(ObjectExtractionJob {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        source,
        enabled_types,
        extraction_config: row.try_get("extraction_config")?,
        status: JobStatus::from_sql(&status_str)
            .ok_or_else(|| CoreError::Internal(format!("unknown job status: {status_str}")))?,
        priority: row.try_get("priority")?,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        last_error: row.try_get("last_error")?,
        discovered_types,
        objects_created: row.try_get("objects_created")?,
        relationships_created: row.try_get("relationships_created")?,
        processed_items: row.try_get("processed_items")?,
        total_items: row.try_get("total_items")?,
    })
}

pub struct ObjectExtractionQueue {
    pool: PgPool,
    config: ExtractionQueueConfig,
}

impl ObjectExtractionQueue {
    pub fn new(pool: PgPool, config: ExtractionQueueConfig) -> Self {
        ObjectExtractionQueue { pool, config }
    }

    pub async fn create_job(&self, options: CreateExtractionJobOptions) -> Result<ObjectExtractionJob, CoreError> {
        let (source_type, document_id, chunk_id, text) = match &options.source {
            SourceSelector::Document(id) => ("document", Some(*id), None, None),
            SourceSelector::Chunk(id) => ("chunk", None, Some(*id), None),
            SourceSelector::Manual(text) => ("manual", None, None, Some(text.clone())),
        };

        let row = sqlx::query(
            "INSERT INTO object_extraction_jobs
                (id, project_id, source_type, source_document_id, source_chunk_id, source_text,
                 enabled_types, extraction_config, status, priority, scheduled_at, retry_count, max_retries,
                 discovered_types, objects_created, relationships_created, processed_items, total_items,
                 created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, now(), 0, $10, '[]'::jsonb, 0, 0, 0, 0, $11, now(), now())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(options.project_id)
        .bind(source_type)
        .bind(document_id)
        .bind(chunk_id)
        .bind(text)
        .bind(serde_json::to_value(&options.enabled_types).unwrap_or(Value::Array(vec![])))
        .bind(options.extraction_config)
        .bind(options.priority)
        .bind(self.config.default_max_retries as i32)
        .bind(options.created_by)
        .fetch_one(&self.pool)
        .await?;
        row_to_job(&row)
    }

    pub async fn dequeue(&self, batch_size: i64) -> Result<Vec<ObjectExtractionJob>, CoreError> {
        let query = ClaimQuery {
            table: TABLE,
            ready_predicate: "status = 'pending' AND scheduled_at <= now()",
            set_clause: "status = 'processing', started_at = now()",
        };
        let rows = jobstore::claim_batch(&self.pool, &query, batch_size, 1).await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Records in-flight progress only — `processed_items`/`total_items` are
    /// purely informational counters for an extraction run still underway.
    /// `objects_created`/`relationships_created` are real result counts and
    /// are only ever written by `mark_completed`; this method must not touch
    /// them.
    pub async fn update_progress(&self, id: Uuid, processed: i64, total: i64) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE object_extraction_jobs SET processed_items = $2, total_items = $3, updated_at = now()
             WHERE id = $1")
            .bind(id)
            .bind(processed)
            .bind(total)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        id: Uuid,
        discovered_types: &[String],
        objects_created: i64,
        relationships_created: i64,
        total_items: i64,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE object_extraction_jobs
             SET status = 'completed', completed_at = now(), last_error = NULL,
                 discovered_types = $2, objects_created = $3, relationships_created = $4,
                 total_items = $5, updated_at = now()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(serde_json::to_value(discovered_types).unwrap_or(Value::Array(vec![])))
        .bind(objects_created)
        .bind(relationships_created)
        .bind(total_items)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str, error_details: Option<Value>) -> Result<(), CoreError> {
        let row = sqlx::query(
            "SELECT retry_count, max_retries FROM object_extraction_jobs WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(()) };
        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;
        let new_retry_count = retry_count + 1;

        if new_retry_count >= max_retries {
            sqlx::query(
                "UPDATE object_extraction_jobs
                 SET status = 'dead_letter', retry_count = $2, started_at = NULL,
                     last_error = $3, error_details = $4, updated_at = now()
                 WHERE id = $1 AND status = 'processing'",
            )
            .bind(id)
            .bind(new_retry_count)
            .bind(truncate_error(error))
            .bind(error_details)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let delay = exponential_backoff(
            retry_count.max(0) as u32,
            Duration::from_millis(10_000),
            3,
            Duration::from_millis(300_000),
        );

        sqlx::query(
            "UPDATE object_extraction_jobs
             SET status = 'pending', retry_count = $2, started_at = NULL,
                 scheduled_at = now() + ($3 || ' milliseconds')::interval,
                 last_error = $4, error_details = $5, updated_at = now()
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(new_retry_count)
        .bind(delay.as_millis().to_string())
        .bind(truncate_error(error))
        .bind(error_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueAdmin for ObjectExtractionQueue {
    async fn stats(&self, project_id: Uuid) -> Result<QueueStats, CoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM object_extraction_jobs WHERE project_id = $1 GROUP BY status")
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
            "UPDATE object_extraction_jobs SET status = 'cancelled', updated_at = now() WHERE id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_cancel(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE object_extraction_jobs SET status = 'cancelled', updated_at = now() WHERE project_id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn bulk_retry_failed(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "UPDATE object_extraction_jobs
             SET status = 'pending', scheduled_at = now(), retry_count = 0, last_error = NULL, error_details = NULL, updated_at = now()
             WHERE project_id = $1 AND status = 'dead_letter'",
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_completed(&self, project_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM object_extraction_jobs WHERE project_id = $1 AND status = 'completed'")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, threshold_minutes: i64) -> Result<u64, CoreError> {
        jobstore::recover_stale(&self.pool, TABLE, threshold_minutes).await
    }
}

pub struct ObjectExtractionProcessor {
    pub queue: Arc<ObjectExtractionQueue>,
    pub documents: Arc<dyn DocumentService>,
    pub schemas: Arc<dyn SchemaProvider>,
    pub model_factory: Arc<dyn ModelFactory>,
    pub graph: Arc<dyn crate::services::GraphService>,
    pub orphan_threshold: f64,
    pub max_retries: u32,
}

#[async_trait]
impl JobProcessor for ObjectExtractionProcessor {
    type Job = ObjectExtractionJob;

    async fn dequeue(&self, _batch_size: i64) -> Result<Vec<Self::Job>, CoreError> {
        // Dequeue one at a time: the extraction pipeline call is the
        // expensive unit of work, not the row claim.
        self.queue.dequeue(1).await
    }

    async fn process(&self, job: Self::Job, cancel: CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let text = match self.load_text(&job.source).await {
            Ok(text) => text,
            Err(e) => {
                let _ = self.queue.mark_failed(job.id, &e.to_string(), None).await;
                return Outcome::Failed;
            }
        };

        let schemas = match self.schemas.get_project_schemas(job.project_id).await {
            Ok(schemas) => schemas,
            Err(e) => {
                let _ = self.queue.mark_failed(job.id, &e.to_string(), None).await;
                return Outcome::Failed;
            }
        };

        let model_factory = self.model_factory.as_ref();
        let pipeline = ExtractionPipeline::new(model_factory);
        let allowed = if job.enabled_types.is_empty() { None } else { Some(job.enabled_types.as_slice()) };

        let result = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = pipeline.run(&text, &schemas.object_schemas, &schemas.relationship_schemas, allowed, self.orphan_threshold, self.max_retries) => result,
        };

        let extraction = match result {
            Ok(extraction) => extraction,
            Err(e) => {
                let details = serde_json::json!({ "error": e.to_string() });
                let _ = self.queue.mark_failed(job.id, &e.to_string(), Some(details)).await;
                return Outcome::Failed;
            }
        };

        let mut temp_id_map: HashMap<String, Uuid> = HashMap::new();
        let mut discovered_types = std::collections::HashSet::new();

        for entity in &extraction.entities {
            discovered_types.insert(entity.entity_type.clone());
            match self
                .graph
                .create_object(
                    job.project_id,
                    NewGraphObject {
                        object_type: entity.entity_type.clone(),
                        key: Some(entity.name.clone()),
                        properties: entity.properties.clone(),
                    },
                )
                .await
            {
                Ok(created) => {
                    temp_id_map.insert(entity.temp_id.clone(), created.id);
                }
                Err(e) => {
                    warn!(error = %e, temp_id = %entity.temp_id, "failed to persist extracted entity");
                }
            }
        }

        let mut relationships_created = 0i64;
        for relationship in &extraction.relationships {
            let (Some(&source_id), Some(&target_id)) = (
                temp_id_map.get(&relationship.source_ref),
                temp_id_map.get(&relationship.target_ref),
            ) else {
                warn!(
                    source = %relationship.source_ref,
                    target = %relationship.target_ref,
                    "dropping relationship with an unresolved endpoint"
                );
                continue;
            };
            discovered_types.insert(relationship.relationship_type.clone());
            match self
                .graph
                .create_relationship(
                    job.project_id,
                    NewGraphRelationship {
                        source_id,
                        target_id,
                        relationship_type: relationship.relationship_type.clone(),
                    },
                )
                .await
            {
                Ok(_) => relationships_created += 1,
                Err(e) => warn!(error = %e, "failed to persist extracted relationship"),
            }
        }

        let objects_created = temp_id_map.len() as i64;
        let total_items = objects_created + relationships_created;
        let discovered: Vec<String> = discovered_types.into_iter().collect();

        match self
            .queue
            .mark_completed(job.id, &discovered, objects_created, relationships_created, total_items)
            .await
        {
            Ok(()) => Outcome::Completed,
            Err(e) => {
                warn!(error = %e, "mark_completed failed; row will be recovered as stale");
                Outcome::Failed
            }
        }
    }

    async fn recover_stale(&self) -> Result<u64, CoreError> {
        self.queue.recover_stale(30).await
    }

    fn configured_concurrency(&self) -> usize {
        1
    }

    fn configured_batch_size(&self) -> i64 {
        1
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(5_000)
    }
}

impl ObjectExtractionProcessor {
    async fn load_text(&self, source: &SourceSelector) -> Result<String, CoreError> {
        match source {
            SourceSelector::Manual(text) => Ok(text.clone()),
            SourceSelector::Document(id) => {
                let document = self
                    .documents
                    .get_document(*id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("document", id.to_string()))?;
                document
                    .parsed_content
                    .ok_or_else(|| CoreError::Internal("document has no parsed content".to_string()))
            }
            SourceSelector::Chunk(id) => {
                let chunk = self
                    .documents
                    .get_chunk(*id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("chunk", id.to_string()))?;
                Ok(chunk.text)
            }
        }
    }
}
