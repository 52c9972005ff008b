use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use common::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::document::{Document, StructuredSummary},
    },
    utils::llm::LlmClient,
};
use connectors::{parser::DocumentParser, SourceDocument};
use vector_store::{DocumentToEmbed, UpsertStats, VectorService};

use crate::extractor;

/// Seams between the per-document pipeline and its collaborators; mocked in
/// pipeline tests.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    /// bytes + filename → text, for sources that emit raw payloads.
    async fn parse_bytes(&self, bytes: &Bytes, filename: &str) -> Result<String, AppError>;

    async fn summarize(&self, document: &Document)
        -> Result<Option<StructuredSummary>, AppError>;

    async fn embed_document(
        &self,
        tenant_id: &str,
        document: &Document,
    ) -> Result<UpsertStats, AppError>;

    /// Optional blob retention for connector-captured files.
    async fn retain_file(
        &self,
        tenant_id: &str,
        source_document: &SourceDocument,
    ) -> Result<(), AppError>;
}

pub struct DefaultPipelineServices {
    parser: Arc<dyn DocumentParser>,
    llm: Arc<dyn LlmClient>,
    vector: Arc<VectorService>,
    storage: Option<StorageManager>,
    /// Global cap on concurrent LLM calls; shared across tenants to protect
    /// the provider quota.
    llm_permits: Arc<Semaphore>,
}

impl DefaultPipelineServices {
    pub fn new(
        parser: Arc<dyn DocumentParser>,
        llm: Arc<dyn LlmClient>,
        vector: Arc<VectorService>,
        storage: Option<StorageManager>,
        llm_concurrency: usize,
    ) -> Self {
        Self {
            parser,
            llm,
            vector,
            storage,
            llm_permits: Arc::new(Semaphore::new(llm_concurrency.max(1))),
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn parse_bytes(&self, bytes: &Bytes, filename: &str) -> Result<String, AppError> {
        let extension = filename.rsplit('.').next().unwrap_or_default();
        self.parser.parse(bytes, filename, extension).await
    }

    async fn summarize(
        &self,
        document: &Document,
    ) -> Result<Option<StructuredSummary>, AppError> {
        let _permit = self
            .llm_permits
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("llm semaphore closed".into()))?;
        extractor::summarize_content(
            self.llm.as_ref(),
            &document.title,
            &document.doc_type,
            &document.content,
        )
        .await
    }

    async fn embed_document(
        &self,
        tenant_id: &str,
        document: &Document,
    ) -> Result<UpsertStats, AppError> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert(
            "source_type".to_string(),
            serde_json::Value::String(document.source_type.as_str().to_string()),
        );
        if let Some(sender) = &document.sender {
            metadata.insert(
                "sender".to_string(),
                serde_json::Value::String(sender.clone()),
            );
        }

        self.vector
            .embed_and_upsert(
                &[DocumentToEmbed {
                    doc_id: document.doc_id(),
                    title: document.title.clone(),
                    content: document.content.clone(),
                    sender: document.sender.clone(),
                    metadata,
                }],
                tenant_id,
            )
            .await
    }

    async fn retain_file(
        &self,
        tenant_id: &str,
        source_document: &SourceDocument,
    ) -> Result<(), AppError> {
        let (Some(storage), Some(bytes), Some(filename)) = (
            &self.storage,
            &source_document.bytes,
            &source_document.filename,
        ) else {
            return Ok(());
        };

        let location = StorageManager::file_location(
            tenant_id,
            source_document.source.as_str(),
            filename,
        );
        storage
            .put(&location, bytes.clone())
            .await
            .map_err(|e| AppError::InternalError(format!("blob retention: {e}")))?;

        Ok(())
    }
}
