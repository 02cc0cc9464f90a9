/// Embedding Sweeper: a periodic backstop for rows that never got an
/// embedding job enqueued (or whose job was lost/deleted) plus relationships,
/// which have no dedicated job queue of their own and get embedded inline.
///
/// Two passes per tick: graph objects missing an embedding get an
/// `object_embedding` job at the lowest priority; relationships missing an
/// embedding are embedded synchronously and written straight back.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SweepConfig;
use crate::errors::CoreError;
use crate::queue::object_embedding::ObjectEmbeddingQueue;
use crate::queue::relationship_embedding::build_relationship_text;
use crate::services::{EmbeddingService, GraphService};

pub struct Sweeper {
    pool: PgPool,
    config: SweepConfig,
    object_embedding_queue: Arc<ObjectEmbeddingQueue>,
    graph: Arc<dyn GraphService>,
    embeddings: Arc<dyn EmbeddingService>,
}

impl Sweeper {
    pub fn new(
        pool: PgPool,
        config: SweepConfig,
        object_embedding_queue: Arc<ObjectEmbeddingQueue>,
        graph: Arc<dyn GraphService>,
        embeddings: Arc<dyn EmbeddingService>,
    ) -> Self {
        Sweeper { pool, config, object_embedding_queue, graph, embeddings }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_s.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_objects(&cancel).await {
                        warn!(error = %e, "object embedding sweep failed");
                    }
                    if let Err(e) = self.sweep_relationships(&cancel).await {
                        warn!(error = %e, "relationship embedding sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep_objects(&self, cancel: &CancellationToken) -> Result<usize, CoreError> {
        let rows = sqlx::query(
            "SELECT o.id, o.project_id FROM graph_objects o
             WHERE o.embedding IS NULL AND o.deleted_at IS NULL
               AND NOT EXISTS (
                 SELECT 1 FROM object_embedding_jobs j
                 WHERE j.object_id = o.id AND j.status IN ('pending', 'processing')
               )
             LIMIT $1",
        )
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut enqueued = 0usize;
        for row in rows {
            if cancel.is_cancelled() {
                break;
            }
            let id: Uuid = row.try_get("id")?;
            let project_id: Uuid = row.try_get("project_id")?;
            match self.object_embedding_queue.enqueue(id, project_id, 0, None).await {
                Ok(_) => enqueued += 1,
                Err(e) => warn!(error = %e, object_id = %id, "failed to enqueue swept object"),
            }
        }
        if enqueued > 0 {
            info!(enqueued, "embedding sweep enqueued missing object embeddings");
        }
        Ok(enqueued)
    }

    async fn sweep_relationships(&self, cancel: &CancellationToken) -> Result<usize, CoreError> {
        let rows = sqlx::query(
            "SELECT r.id, r.source_id, r.target_id, r.relationship_type
             FROM graph_relationships r
             JOIN graph_objects s ON s.id = r.source_id AND s.deleted_at IS NULL
             JOIN graph_objects t ON t.id = r.target_id AND t.deleted_at IS NULL
             WHERE r.embedding IS NULL AND r.deleted_at IS NULL
             LIMIT $1",
        )
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut embedded = 0usize;
        for row in rows {
            if cancel.is_cancelled() {
                break;
            }
            let id: Uuid = row.try_get("id")?;
            if let Err(e) = self.embed_one_relationship(id).await {
                warn!(error = %e, relationship_id = %id, "failed to embed swept relationship");
            } else {
                embedded += 1;
            }
        }
        if embedded > 0 {
            info!(embedded, "embedding sweep wrote missing relationship embeddings");
        }
        Ok(embedded)
    }

    async fn embed_one_relationship(&self, id: Uuid) -> Result<(), CoreError> {
        let relationship = self
            .graph
            .get_relationship(id)
            .await?
            .ok_or_else(|| CoreError::not_found("relationship", id.to_string()))?;
        let source = self
            .graph
            .get_object(relationship.source_id)
            .await?
            .ok_or_else(|| CoreError::not_found("graph_object", relationship.source_id.to_string()))?;
        let target = self
            .graph
            .get_object(relationship.target_id)
            .await?
            .ok_or_else(|| CoreError::not_found("graph_object", relationship.target_id.to_string()))?;

        let text = build_relationship_text(&source, &relationship.relationship_type, &target);
        let result = self.embeddings.embed(&text).await?;
        if result.embedding.is_empty() {
            return Err(CoreError::Internal("no embedding returned".to_string()));
        }
        self.graph.patch_relationship_embedding(id, result.embedding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_floors_to_one_second() {
        let config = SweepConfig { sweep_interval_s: 0, batch_size: 50 };
        assert_eq!(config.sweep_interval_s.max(1), 1);
    }
}
