//! # epicrag-fhir
//!
//! Patient data retrieval from an Epic FHIR R4 server.
//!
//! - [`fetcher`] - Authenticated, paginated searches with rate-limit and
//!   transient-error retries
//! - [`query`] - Search queries and Bundle pages
//! - [`resources`] - Typed views over Patient, Condition, MedicationRequest
//!   and Observation
//! - [`normalizer`] - Rendering of resources into text chunks with metadata

pub mod error;
pub mod fetcher;
pub mod normalizer;
pub mod query;
pub mod resources;

pub use error::FetchError;
pub use fetcher::{DEFAULT_OBSERVATION_CATEGORY, FHIR_JSON, FetcherConfig, FhirFetcher};
pub use normalizer::{ChunkMetadata, DEFAULT_MAX_OBSERVATIONS, NormalizedChunk, ResourceNormalizer};
pub use query::{FhirPage, FhirQuery, ResourceType};
pub use resources::{Condition, MedicationRequest, Observation, Patient, PatientRecord};

/// Type alias for fetch results.
pub type FetchResult<T> = Result<T, FetchError>;
