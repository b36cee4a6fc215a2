//! # epicrag-index
//!
//! Vector indexing of normalized patient records and retrieval-augmented
//! question answering on top of it.
//!
//! - [`embeddings`] - [`EmbeddingProvider`] and the OpenAI embeddings client
//! - [`store`] - [`VectorStore`] and the JSON-backed cosine store
//! - [`indexer`] - Normalize, embed and store a [`PatientRecord`](epicrag_fhir::PatientRecord)
//! - [`chat`] - [`ChatModel`] and the OpenAI chat client
//! - [`qa`] - Retrieval, context assembly and answering

pub mod chat;
pub mod embeddings;
pub mod error;
pub mod indexer;
pub mod openai;
pub mod qa;
pub mod store;

pub use chat::{ChatMessage, ChatModel, OpenAiChat, Role};
pub use embeddings::{EmbeddingProvider, OpenAiEmbeddings};
pub use error::IndexError;
pub use indexer::{IndexReport, Indexer};
pub use openai::OpenAiClient;
pub use qa::{Answer, RetrievalQa};
pub use store::{
    CollectionStats, DEFAULT_COLLECTION, JsonVectorStore, QueryFilter, ScoredChunk, StoredChunk,
    VectorStore,
};

/// Type alias for indexing results.
pub type IndexResult<T> = Result<T, IndexError>;
