//! Text embedding providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::IndexResult;
use crate::error::IndexError;
use crate::openai::OpenAiClient;

/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Inputs sent per embeddings request.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds every text, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>>;

    /// Identifier of the model producing the vectors.
    fn model(&self) -> &str;

    /// Embeds a single text.
    async fn embed_one(&self, text: &str) -> IndexResult<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| IndexError::invalid_response("embeddings", "no embedding returned"))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI `/embeddings` client.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddings {
    client: OpenAiClient,
    model: String,
    batch_size: usize,
}

impl OpenAiEmbeddings {
    #[must_use]
    pub fn new(client: OpenAiClient) -> Self {
        Self {
            client,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn embed_batch(&self, batch: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: batch,
        };
        let mut response: EmbeddingResponse = self
            .client
            .post_json("embeddings", "embeddings", &request)
            .await?;

        if response.data.len() != batch.len() {
            return Err(IndexError::invalid_response(
                "embeddings",
                format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    response.data.len()
                ),
            ));
        }
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!(
                batch = i + 1,
                done = vectors.len(),
                total = texts.len(),
                "Embedding batch"
            );
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
