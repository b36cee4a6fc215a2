//! Embedding and storage of normalized patient records.

use std::collections::BTreeMap;
use std::sync::Arc;

use epicrag_fhir::{PatientRecord, ResourceNormalizer};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::IndexResult;
use crate::embeddings::EmbeddingProvider;
use crate::error::IndexError;
use crate::store::{CollectionStats, StoredChunk, VectorStore};

/// Outcome of indexing one patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub patient_id: String,
    /// Chunks written.
    pub indexed: usize,
    /// Chunks of an earlier run that were replaced.
    pub replaced: usize,
    /// Chunks written per resource type.
    pub by_type: BTreeMap<String, usize>,
}

/// Turns fetched patient records into stored, embedded chunks.
pub struct Indexer {
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    normalizer: ResourceNormalizer,
}

impl Indexer {
    /// Creates an indexer using the default [`ResourceNormalizer`].
    #[must_use]
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embeddings,
            store,
            normalizer: ResourceNormalizer::default(),
        }
    }

    /// Replaces the normalizer, e.g. to change the observation limit.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: ResourceNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Normalizes, embeds and stores a patient's record, replacing whatever
    /// was indexed for that patient before.
    ///
    /// Old chunks are only replaced once the new ones are embedded and
    /// accepted by the store, so a failed run leaves the previous index intact.
    ///
    /// # Errors
    /// Fails if embedding or storage fails.
    pub async fn index_patient(&self, record: &PatientRecord) -> IndexResult<IndexReport> {
        let patient_id = record.patient_id.as_str();
        let chunks = self.normalizer.normalize(record);
        tracing::info!(
            patient_id,
            chunks = chunks.len(),
            model = self.embeddings.model(),
            "Embedding patient chunks"
        );

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embeddings.embed(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(IndexError::invalid_response(
                "embeddings",
                format!("expected {} embeddings, got {}", chunks.len(), vectors.len()),
            ));
        }

        let indexed_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| IndexError::store(format!("timestamp formatting failed: {e}")))?;

        let mut by_type = BTreeMap::new();
        let stored: Vec<StoredChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| {
                *by_type.entry(chunk.metadata.resource_type.clone()).or_insert(0) += 1;
                StoredChunk {
                    id: chunk.id,
                    text: chunk.text,
                    metadata: chunk.metadata,
                    embedding,
                    indexed_at: indexed_at.clone(),
                }
            })
            .collect();
        let indexed = stored.len();

        let replaced = self.store.replace_patient(patient_id, stored).await?;

        tracing::info!(patient_id, indexed, replaced, "Indexed patient");
        Ok(IndexReport {
            patient_id: patient_id.to_string(),
            indexed,
            replaced,
            by_type,
        })
    }

    /// Collection statistics.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn stats(&self) -> IndexResult<CollectionStats> {
        self.store.stats().await
    }
}
