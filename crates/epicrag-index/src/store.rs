//! Vector storage.
//!
//! [`JsonVectorStore`] keeps one collection in memory and persists it as a
//! JSON file after every write. Vectors are L2-normalized on insert, so
//! cosine similarity is a plain dot product at query time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use epicrag_fhir::ChunkMetadata;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::IndexResult;
use crate::error::IndexError;

/// Default collection name.
pub const DEFAULT_COLLECTION: &str = "patient_records";

/// A chunk with its embedding, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
    /// RFC 3339 time the chunk was indexed.
    pub indexed_at: String,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Cosine similarity to the query, in `[-1, 1]`.
    pub score: f32,
}

/// Metadata constraints for a query. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub patient_id: Option<String>,
    pub resource_type: Option<String>,
}

impl QueryFilter {
    /// Only chunks of one patient.
    #[must_use]
    pub fn patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: Some(patient_id.into()),
            resource_type: None,
        }
    }

    #[must_use]
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    #[must_use]
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.patient_id
            .as_ref()
            .is_none_or(|p| *p == metadata.patient_id)
            && self
                .resource_type
                .as_ref()
                .is_none_or(|t| *t == metadata.resource_type)
    }
}

/// Collection statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub collection_name: String,
    pub total_documents: usize,
    pub patients: usize,
}

/// Storage of embedded chunks, keyed by chunk id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Inserts or replaces chunks by id.
    async fn upsert(&self, chunks: Vec<StoredChunk>) -> IndexResult<()>;

    /// Returns the `n` chunks most similar to `embedding` that match `filter`,
    /// best first.
    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: &QueryFilter,
    ) -> IndexResult<Vec<ScoredChunk>>;

    /// Number of stored chunks.
    async fn count(&self) -> IndexResult<usize>;

    /// Removes every chunk of a patient, returning how many were removed.
    async fn delete_patient(&self, patient_id: &str) -> IndexResult<usize>;

    /// Replaces every chunk of a patient with `chunks` in one step, returning
    /// how many old chunks were removed.
    ///
    /// If the new chunks are rejected, the patient's existing chunks are kept.
    async fn replace_patient(
        &self,
        patient_id: &str,
        chunks: Vec<StoredChunk>,
    ) -> IndexResult<usize>;

    /// Collection statistics.
    async fn stats(&self) -> IndexResult<CollectionStats>;
}

/// Scales `v` to unit length. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity of two L2-normalized vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same length");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collection {
    name: String,
    #[serde(default)]
    dimension: Option<usize>,
    #[serde(default)]
    chunks: BTreeMap<String, StoredChunk>,
}

impl Collection {
    fn check_dimension(&self, actual: usize) -> IndexResult<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(IndexError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Dimension `chunks` would give the collection, checked against
    /// `expected` (the collection's dimension, or `None` if it will be empty).
    fn dimension_for(
        expected: Option<usize>,
        chunks: &[StoredChunk],
    ) -> IndexResult<Option<usize>> {
        let Some(first) = chunks.first() else {
            return Ok(expected);
        };
        let dimension = expected.unwrap_or(first.embedding.len());
        if dimension == 0 {
            return Err(IndexError::invalid_input("embedding is empty"));
        }
        if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: bad.embedding.len(),
            });
        }
        Ok(Some(dimension))
    }

    fn insert_all(&mut self, chunks: Vec<StoredChunk>) {
        for mut chunk in chunks {
            l2_normalize(&mut chunk.embedding);
            self.chunks.insert(chunk.id.clone(), chunk);
        }
    }

    /// Removes a patient's chunks, forgetting the dimension once empty.
    fn remove_patient(&mut self, patient_id: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|_, c| c.metadata.patient_id != patient_id);
        if self.chunks.is_empty() {
            self.dimension = None;
        }
        before - self.chunks.len()
    }
}

/// Cosine-similarity store persisted as a JSON file.
pub struct JsonVectorStore {
    path: Option<PathBuf>,
    name: String,
    inner: RwLock<Collection>,
}

impl JsonVectorStore {
    /// Opens the collection stored at `path`, creating an empty one if the
    /// file does not exist yet.
    ///
    /// # Errors
    /// Returns [`IndexError::Store`] if the file is unreadable, is not a
    /// collection, or holds a collection with a different name.
    pub async fn open(path: impl AsRef<Path>, collection: &str) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let stored: Collection = serde_json::from_slice(&bytes).map_err(|e| {
                    IndexError::store(format!("{} is not a vector store: {e}", path.display()))
                })?;
                if stored.name != collection {
                    return Err(IndexError::store(format!(
                        "{} holds collection '{}', expected '{collection}'",
                        path.display(),
                        stored.name
                    )));
                }
                tracing::debug!(
                    path = %path.display(),
                    documents = stored.chunks.len(),
                    "Loaded vector store"
                );
                stored
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collection {
                name: collection.to_string(),
                ..Collection::default()
            },
            Err(e) => {
                return Err(IndexError::store(format!("cannot read {}: {e}", path.display())));
            }
        };

        Ok(Self {
            path: Some(path),
            name: collection.to_string(),
            inner: RwLock::new(inner),
        })
    }

    /// A store that is never written to disk.
    #[must_use]
    pub fn in_memory(collection: &str) -> Self {
        Self {
            path: None,
            name: collection.to_string(),
            inner: RwLock::new(Collection {
                name: collection.to_string(),
                ..Collection::default()
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes to a temporary file, then renames it over the store.
    async fn persist(&self, collection: &Collection) -> IndexResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec(collection)
            .map_err(|e| IndexError::store(format!("serialization failed: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IndexError::store(format!("cannot create {}: {e}", parent.display())))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| IndexError::store(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| IndexError::store(format!("cannot replace {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for JsonVectorStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, chunks: Vec<StoredChunk>) -> IndexResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut collection = self.inner.write().await;
        let dimension = Collection::dimension_for(collection.dimension, &chunks)?;

        let mut next = collection.clone();
        next.dimension = dimension;
        next.insert_all(chunks);
        self.persist(&next).await?;
        *collection = next;
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: &QueryFilter,
    ) -> IndexResult<Vec<ScoredChunk>> {
        let collection = self.inner.read().await;
        if collection.chunks.is_empty() || n == 0 {
            return Ok(Vec::new());
        }
        collection.check_dimension(embedding.len())?;

        let mut query = embedding.to_vec();
        l2_normalize(&mut query);

        let mut hits: Vec<ScoredChunk> = collection
            .chunks
            .values()
            .filter(|c| filter.matches(&c.metadata))
            .map(|c| ScoredChunk {
                id: c.id.clone(),
                text: c.text.clone(),
                metadata: c.metadata.clone(),
                score: cosine_similarity(&query, &c.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(n);
        Ok(hits)
    }

    async fn count(&self) -> IndexResult<usize> {
        Ok(self.inner.read().await.chunks.len())
    }

    async fn delete_patient(&self, patient_id: &str) -> IndexResult<usize> {
        let mut collection = self.inner.write().await;
        let mut next = collection.clone();
        let removed = next.remove_patient(patient_id);
        if removed > 0 {
            self.persist(&next).await?;
            *collection = next;
        }
        Ok(removed)
    }

    async fn replace_patient(
        &self,
        patient_id: &str,
        chunks: Vec<StoredChunk>,
    ) -> IndexResult<usize> {
        let mut collection = self.inner.write().await;

        let mut next = collection.clone();
        let removed = next.remove_patient(patient_id);
        next.dimension = Collection::dimension_for(next.dimension, &chunks)?;
        next.insert_all(chunks);

        self.persist(&next).await?;
        *collection = next;
        Ok(removed)
    }

    async fn stats(&self) -> IndexResult<CollectionStats> {
        let collection = self.inner.read().await;
        let mut patients: Vec<&str> = collection
            .chunks
            .values()
            .map(|c| c.metadata.patient_id.as_str())
            .collect();
        patients.sort_unstable();
        patients.dedup();

        Ok(CollectionStats {
            collection_name: self.name.clone(),
            total_documents: collection.chunks.len(),
            patients: patients.len(),
        })
    }
}
