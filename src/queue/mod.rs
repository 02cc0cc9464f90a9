/// Queue Service: per-kind job repositories built on the shared claim
/// primitive in `crate::jobstore`. Each kind writes its own SQL (matching
/// the ambient stack's preference for explicit queries over a generic ORM
/// layer) but shares the `JobStatus` vocabulary, `QueueStats` shape, and the
/// `QueueAdmin` surface that is identical across kinds.

pub mod chunk_embedding;
pub mod document_parsing;
pub mod object_embedding;
pub mod object_extraction;
pub mod relationship_embedding;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    DeadLetter,
    RetryPending,
}

impl JobStatus {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::RetryPending => "retry_pending",
        }
    }

    pub fn from_sql(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "dead_letter" => Some(JobStatus::DeadLetter),
            "retry_pending" => Some(JobStatus::RetryPending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub dead_letter: i64,
    pub retry_pending: i64,
}

/// Operations identical across every queue kind. `update_progress` is
/// intentionally excluded: only the object-extraction kind carries progress
/// counters, so it lives on `ObjectExtractionQueue` directly.
#[async_trait]
pub trait QueueAdmin: Send + Sync {
    async fn stats(&self, project_id: Uuid) -> Result<QueueStats, CoreError>;
    async fn cancel(&self, id: Uuid) -> Result<bool, CoreError>;
    async fn bulk_cancel(&self, project_id: Uuid) -> Result<u64, CoreError>;
    async fn bulk_retry_failed(&self, project_id: Uuid) -> Result<u64, CoreError>;
    async fn delete_completed(&self, project_id: Uuid) -> Result<u64, CoreError>;
    async fn recover_stale(&self, threshold_minutes: i64) -> Result<u64, CoreError>;
}

/// Builds a `QueueStats` from `(status, count)` rows, tolerating unknown
/// status strings by ignoring them rather than failing the whole query.
pub(crate) fn stats_from_rows(rows: Vec<(String, i64)>) -> QueueStats {
    let mut stats = QueueStats::default();
    for (status, count) in rows {
        match JobStatus::from_sql(&status) {
            Some(JobStatus::Pending) => stats.pending = count,
            Some(JobStatus::Processing) => stats.processing = count,
            Some(JobStatus::Completed) => stats.completed = count,
            Some(JobStatus::Failed) => stats.failed = count,
            Some(JobStatus::Cancelled) => stats.cancelled = count,
            Some(JobStatus::DeadLetter) => stats.dead_letter = count,
            Some(JobStatus::RetryPending) => stats.retry_pending = count,
            None => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_sql_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::DeadLetter,
            JobStatus::RetryPending,
        ] {
            assert_eq!(JobStatus::from_sql(status.as_sql()), Some(status));
        }
    }

    #[test]
    fn stats_from_rows_ignores_unknown_statuses() {
        let stats = stats_from_rows(vec![
            ("pending".to_string(), 3),
            ("bogus".to_string(), 99),
            ("dead_letter".to_string(), 1),
        ]);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.dead_letter, 1);
    }
}
