//! Flattens fetched resources into text chunks for embedding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::ResourceType;
use crate::resources::{Condition, MedicationRequest, Observation, Patient, PatientRecord};

/// Default cap on observations turned into chunks per patient.
pub const DEFAULT_MAX_OBSERVATIONS: usize = 50;

/// Metadata stored alongside each chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub patient_id: String,
    pub resource_type: String,
    pub resource_id: String,
    /// Clinically relevant date (birth date, onset, authored or effective).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// One resource rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedChunk {
    /// Stable id; re-indexing the same resource yields the same id.
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Converts a [`PatientRecord`] into [`NormalizedChunk`]s.
#[derive(Debug, Clone)]
pub struct ResourceNormalizer {
    max_observations: usize,
}

impl Default for ResourceNormalizer {
    fn default() -> Self {
        Self {
            max_observations: DEFAULT_MAX_OBSERVATIONS,
        }
    }
}

impl ResourceNormalizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many observations are kept per patient.
    #[must_use]
    pub fn with_max_observations(mut self, max: usize) -> Self {
        self.max_observations = max;
        self
    }

    /// Normalizes the whole record: the Patient first, then Conditions,
    /// MedicationRequests and the first `max_observations` Observations, each
    /// in fetch order.
    #[must_use]
    pub fn normalize(&self, record: &PatientRecord) -> Vec<NormalizedChunk> {
        let pid = record.patient_id.as_str();
        let mut chunks = Vec::with_capacity(
            1 + record.conditions.len()
                + record.medications.len()
                + record.observations.len().min(self.max_observations),
        );

        chunks.push(self.patient(pid, &record.patient));
        chunks.extend(
            record
                .conditions
                .iter()
                .enumerate()
                .map(|(i, c)| self.condition(pid, c, i)),
        );
        chunks.extend(
            record
                .medications
                .iter()
                .enumerate()
                .map(|(i, m)| self.medication(pid, m, i)),
        );

        if record.observations.len() > self.max_observations {
            tracing::info!(
                patient_id = pid,
                total = record.observations.len(),
                kept = self.max_observations,
                "Sampling observations"
            );
        }
        chunks.extend(
            record
                .observations
                .iter()
                .take(self.max_observations)
                .enumerate()
                .map(|(i, o)| self.observation(pid, o, i)),
        );
        chunks
    }

    /// Normalizes one resource of a known type.
    #[must_use]
    pub fn normalize_resource(
        &self,
        patient_id: &str,
        resource_type: ResourceType,
        resource: &Value,
        index: usize,
    ) -> NormalizedChunk {
        match resource_type {
            ResourceType::Patient => self.patient(patient_id, resource),
            ResourceType::Condition => self.condition(patient_id, resource, index),
            ResourceType::MedicationRequest => self.medication(patient_id, resource, index),
            ResourceType::Observation => self.observation(patient_id, resource, index),
        }
    }

    fn patient(&self, pid: &str, resource: &Value) -> NormalizedChunk {
        let p = Patient::from_value(resource);
        let text = format!(
            "Patient: {}\nGender: {}\nBirth Date: {}",
            p.name.as_deref().unwrap_or("Unknown"),
            p.gender.as_deref().unwrap_or("Unknown"),
            p.birth_date.as_deref().unwrap_or("Unknown"),
        );
        NormalizedChunk {
            id: format!("{pid}_patient"),
            text,
            metadata: ChunkMetadata {
                patient_id: pid.to_string(),
                resource_type: ResourceType::Patient.to_string(),
                resource_id: p.id.unwrap_or_else(|| pid.to_string()),
                date: p.birth_date,
            },
        }
    }

    fn condition(&self, pid: &str, resource: &Value, index: usize) -> NormalizedChunk {
        let c = Condition::from_value(resource);
        let text = format!(
            "Condition: {}\nStatus: {}\nOnset Date: {}",
            c.display.as_deref().unwrap_or("Unknown Condition"),
            c.clinical_status.as_deref().unwrap_or("Unknown Status"),
            c.onset.as_deref().unwrap_or("Unknown Onset Date"),
        );
        let resource_id = c.id.unwrap_or_else(|| format!("condition_{index}"));
        NormalizedChunk {
            id: format!("{pid}_condition_{resource_id}"),
            text,
            metadata: ChunkMetadata {
                patient_id: pid.to_string(),
                resource_type: ResourceType::Condition.to_string(),
                resource_id,
                date: c.onset,
            },
        }
    }

    fn medication(&self, pid: &str, resource: &Value, index: usize) -> NormalizedChunk {
        let m = MedicationRequest::from_value(resource);
        let text = format!(
            "Medication: {}\nStatus: {}\nAuthored: {}\nDosage: {}",
            m.display.as_deref().unwrap_or("Unknown Medication"),
            m.status.as_deref().unwrap_or("Unknown Status"),
            m.authored_on.as_deref().unwrap_or("Unknown Date"),
            m.dosage.as_deref().unwrap_or("No dosage instructions"),
        );
        let resource_id = m.id.unwrap_or_else(|| format!("medication_{index}"));
        NormalizedChunk {
            id: format!("{pid}_medication_{resource_id}"),
            text,
            metadata: ChunkMetadata {
                patient_id: pid.to_string(),
                resource_type: ResourceType::MedicationRequest.to_string(),
                resource_id,
                date: m.authored_on,
            },
        }
    }

    fn observation(&self, pid: &str, resource: &Value, index: usize) -> NormalizedChunk {
        let o = Observation::from_value(resource);
        let text = format!(
            "Observation: {}\nValue: {}\nDate: {}",
            o.display.as_deref().unwrap_or("Unknown Observation"),
            o.value.as_deref().unwrap_or("No value"),
            o.effective.as_deref().unwrap_or("Unknown Date"),
        );
        let resource_id = o.id.unwrap_or_else(|| format!("observation_{index}"));
        NormalizedChunk {
            id: format!("{pid}_observation_{resource_id}"),
            text,
            metadata: ChunkMetadata {
                patient_id: pid.to_string(),
                resource_type: ResourceType::Observation.to_string(),
                resource_id,
                date: o.effective,
            },
        }
    }
}
