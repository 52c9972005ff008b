use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::AppError;

/// Narrow embedding capability.
///
/// A single input is expected to be pre-capped by the caller (the vector
/// service truncates anything above its embedding char limit before it gets
/// here).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    fn dimensions(&self) -> u32;

    async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[input.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::Parse("No embedding data received".into()))
    }
}

pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: u32,
    timeout: Duration,
}

impl OpenAiEmbedder {
    pub fn new(
        client: Client<OpenAIConfig>,
        model: impl Into<String>,
        dimensions: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
            timeout,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions)
            .input(inputs.to_vec())
            .build()?;

        let response = tokio::time::timeout(self.timeout, self.client.embeddings().create(request))
            .await
            .map_err(|_| AppError::Transient("embedding deadline exceeded".into()))??;

        if response.data.len() != inputs.len() {
            return Err(AppError::Parse(format!(
                "Embedding response count mismatch: requested {}, received {}",
                inputs.len(),
                response.data.len()
            )));
        }

        // The API carries an index per embedding; order by it rather than trusting
        // response order.
        let mut data = response.data;
        data.sort_by_key(|d| d.index);

        debug!(
            batch = inputs.len(),
            dimensions = self.dimensions,
            "embedding batch created"
        );

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> u32 {
        self.dimensions
    }
}
