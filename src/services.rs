/// External collaborator interfaces.
///
/// Everything in this module is a capability the core consumes but does not
/// own: HTTP routers, the concrete LLM/embedding provider, the blob storage
/// client, and the database driver all live outside this crate. We only
/// specify the trait surface, following the same "depend on a small trait,
/// let the caller supply the real implementation" shape the ambient stack
/// uses for its own `EmbeddingProvider`/`ExtractionProvider` traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedUsage {
    pub prompt_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct EmbedResult {
    pub embedding: Vec<f32>,
    pub usage: Option<EmbedUsage>,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn is_enabled(&self) -> bool;
    async fn embed(&self, text: &str) -> Result<EmbedResult, CoreError>;
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    fn is_enabled(&self) -> bool;
    /// Advertised maximum input size in bytes, if the provider enforces one.
    fn max_file_size_bytes(&self) -> Option<u64>;
    async fn transcribe(
        &self,
        bytes: &[u8],
        filename: &str,
        mime: &str,
        initial_prompt: Option<&str>,
    ) -> Result<String, CoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOpts {
    pub ocr_auto_detect: bool,
}

pub struct ExtractResult {
    pub content: String,
}

#[async_trait]
pub trait DocumentExtractionService: Send + Sync {
    fn should_use(&self, mime: &str, filename: &str) -> bool;
    fn is_email(&self, mime: &str, filename: &str) -> bool;
    async fn extract(
        &self,
        bytes: &[u8],
        filename: &str,
        mime: &str,
        opts: ExtractOpts,
    ) -> Result<ExtractResult, CoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct UploadOpts {
    pub content_type: Option<String>,
}

#[async_trait]
pub trait StorageService: Send + Sync {
    fn enabled(&self) -> bool;
    async fn upload(
        &self,
        key: &str,
        stream: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        size: Option<u64>,
        opts: UploadOpts,
    ) -> Result<(), CoreError>;
    async fn download(&self, key: &str) -> Result<Vec<u8>, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    async fn presign_download(
        &self,
        key: &str,
        expires_in_secs: u64,
        content_disposition: Option<&str>,
    ) -> Result<String, CoreError>;
}

/// Constructs a model capable of entity/relationship extraction calls. The
/// concrete model client (OpenAI, local, whatever) lives outside this crate;
/// this factory just hands the extraction pipeline something that can answer
/// prompts.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn extraction_model(&self) -> Result<Box<dyn ExtractionModel>, CoreError>;
}

#[async_trait]
pub trait ExtractionModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CoreError>;
}

#[derive(Debug, Clone)]
pub struct GraphObject {
    pub id: Uuid,
    pub project_id: Uuid,
    pub object_type: String,
    pub key: Option<String>,
    pub properties: Value,
    pub embedding: Option<Vec<f32>>,
    pub embedding_updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct GraphRelationship {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relationship_type: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: Uuid,
    pub project_id: Uuid,
    pub storage_key: String,
    pub mime: String,
    pub filename: String,
    pub parsed_content: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewGraphObject {
    pub object_type: String,
    pub key: Option<String>,
    pub properties: Value,
}

#[derive(Debug, Clone)]
pub struct NewGraphRelationship {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relationship_type: String,
}

#[async_trait]
pub trait GraphService: Send + Sync {
    async fn get_object(&self, id: Uuid) -> Result<Option<GraphObject>, CoreError>;
    async fn create_object(&self, project_id: Uuid, object: NewGraphObject) -> Result<GraphObject, CoreError>;
    async fn patch_object_embedding(&self, id: Uuid, embedding: Vec<f32>) -> Result<(), CoreError>;

    async fn get_relationship(&self, id: Uuid) -> Result<Option<GraphRelationship>, CoreError>;
    async fn create_relationship(
        &self,
        project_id: Uuid,
        relationship: NewGraphRelationship,
    ) -> Result<GraphRelationship, CoreError>;
    async fn patch_relationship_embedding(&self, id: Uuid, embedding: Vec<f32>) -> Result<(), CoreError>;
}

#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, CoreError>;
    async fn set_parsed_content(&self, id: Uuid, content: String) -> Result<(), CoreError>;

    /// Splits `document_id`'s freshly-parsed content into chunk rows and
    /// enqueues them for embedding. Called once per document, immediately
    /// after a successful parse; chunking itself is owned by the document
    /// store, not this crate.
    async fn enqueue_chunk_creation(&self, document_id: Uuid) -> Result<(), CoreError>;

    async fn get_chunk(&self, id: Uuid) -> Result<Option<Chunk>, CoreError>;
    async fn patch_chunk_embedding(&self, id: Uuid, embedding: Vec<f32>) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthZone {
    Safe,
    Warning,
    Critical,
}

pub trait HealthMonitor: Send + Sync {
    fn get_health(&self) -> HealthZone;
}

#[async_trait]
pub trait ToolPoolInvalidator: Send + Sync {
    async fn invalidate_cache(&self, project_id: Uuid);
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeEmbeddingService {
        pub enabled: bool,
        pub dimension: usize,
    }

    #[async_trait]
    impl EmbeddingService for FakeEmbeddingService {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn embed(&self, text: &str) -> Result<EmbedResult, CoreError> {
            if text.is_empty() {
                return Ok(EmbedResult { embedding: vec![], usage: None });
            }
            Ok(EmbedResult {
                embedding: vec![0.1_f32; self.dimension],
                usage: Some(EmbedUsage { prompt_tokens: text.split_whitespace().count() as u32 }),
            })
        }
    }

    pub struct FakeHealthMonitor {
        pub zone: Mutex<HealthZone>,
    }

    impl FakeHealthMonitor {
        pub fn new(zone: HealthZone) -> Self {
            FakeHealthMonitor { zone: Mutex::new(zone) }
        }

        pub fn set(&self, zone: HealthZone) {
            *self.zone.lock().unwrap() = zone;
        }
    }

    impl HealthMonitor for FakeHealthMonitor {
        fn get_health(&self) -> HealthZone {
            *self.zone.lock().unwrap()
        }
    }

    pub struct NoopToolPoolInvalidator {
        pub calls: Mutex<Vec<Uuid>>,
    }

    impl Default for NoopToolPoolInvalidator {
        fn default() -> Self {
            NoopToolPoolInvalidator { calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ToolPoolInvalidator for NoopToolPoolInvalidator {
        async fn invalidate_cache(&self, project_id: Uuid) {
            self.calls.lock().unwrap().push(project_id);
        }
    }
}
