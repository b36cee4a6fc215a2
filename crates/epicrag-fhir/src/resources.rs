//! Typed views over the raw FHIR resources.
//!
//! Epic resources vary a lot in which elements they populate. Every field
//! here is optional and extraction never fails: a missing or mistyped element
//! simply yields `None`.

use serde::Serialize;
use serde_json::Value;

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.trim().is_empty())
}

fn first<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key)?.as_array()?.first()
}

/// Best human-readable label of a CodeableConcept: first coding display,
/// then the concept text.
fn concept_label(concept: &Value) -> Option<String> {
    first(concept, "coding")
        .and_then(|c| str_at(c, &["display"]))
        .or_else(|| str_at(concept, &["text"]))
        .map(str::to_string)
}

/// Text of a CodeableConcept, falling back to the first coding code.
fn concept_text(concept: &Value) -> Option<String> {
    str_at(concept, &["text"])
        .or_else(|| first(concept, "coding").and_then(|c| str_at(c, &["code"])))
        .map(str::to_string)
}

fn id_of(resource: &Value) -> Option<String> {
    str_at(resource, &["id"]).map(str::to_string)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Patient {
    pub id: Option<String>,
    pub name: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
}

impl Patient {
    #[must_use]
    pub fn from_value(resource: &Value) -> Self {
        let name = first(resource, "name").and_then(|name| {
            str_at(name, &["text"]).map(str::to_string).or_else(|| {
                let given = name
                    .get("given")
                    .and_then(Value::as_array)
                    .map(|g| g.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                    .unwrap_or_default();
                let mut parts = given;
                if let Some(family) = str_at(name, &["family"]) {
                    parts.push(family);
                }
                (!parts.is_empty()).then(|| parts.join(" "))
            })
        });

        Self {
            id: id_of(resource),
            name,
            gender: str_at(resource, &["gender"]).map(str::to_string),
            birth_date: str_at(resource, &["birthDate"]).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Condition {
    pub id: Option<String>,
    pub display: Option<String>,
    pub clinical_status: Option<String>,
    pub onset: Option<String>,
}

impl Condition {
    #[must_use]
    pub fn from_value(resource: &Value) -> Self {
        Self {
            id: id_of(resource),
            display: resource.get("code").and_then(concept_label),
            clinical_status: resource.get("clinicalStatus").and_then(concept_text),
            onset: str_at(resource, &["onsetDateTime"])
                .or_else(|| str_at(resource, &["onsetPeriod", "start"]))
                .or_else(|| str_at(resource, &["recordedDate"]))
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MedicationRequest {
    pub id: Option<String>,
    pub display: Option<String>,
    pub status: Option<String>,
    pub authored_on: Option<String>,
    pub dosage: Option<String>,
}

impl MedicationRequest {
    #[must_use]
    pub fn from_value(resource: &Value) -> Self {
        let display = resource
            .get("medicationCodeableConcept")
            .and_then(concept_label)
            .or_else(|| str_at(resource, &["medicationReference", "display"]).map(str::to_string));
        let dosage = first(resource, "dosageInstruction").and_then(|d| {
            str_at(d, &["text"])
                .or_else(|| str_at(d, &["patientInstruction"]))
                .map(str::to_string)
        });

        Self {
            id: id_of(resource),
            display,
            status: str_at(resource, &["status"]).map(str::to_string),
            authored_on: str_at(resource, &["authoredOn"]).map(str::to_string),
            dosage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Observation {
    pub id: Option<String>,
    pub display: Option<String>,
    pub value: Option<String>,
    pub effective: Option<String>,
}

impl Observation {
    #[must_use]
    pub fn from_value(resource: &Value) -> Self {
        Self {
            id: id_of(resource),
            display: resource.get("code").and_then(concept_label),
            value: observation_value(resource),
            effective: str_at(resource, &["effectiveDateTime"])
                .or_else(|| str_at(resource, &["effectivePeriod", "start"]))
                .or_else(|| str_at(resource, &["issued"]))
                .map(str::to_string),
        }
    }
}

/// `valueQuantity` (value and unit) wins over `valueString`.
fn observation_value(resource: &Value) -> Option<String> {
    if let Some(quantity) = resource.get("valueQuantity") {
        let number = match quantity.get("value") {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            _ => None,
        };
        if let Some(number) = number {
            let unit = str_at(quantity, &["unit"]).or_else(|| str_at(quantity, &["code"]));
            return Some(match unit {
                Some(unit) => format!("{number} {unit}"),
                None => number,
            });
        }
    }
    str_at(resource, &["valueString"]).map(str::to_string)
}

/// Everything fetched for one patient.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient: Value,
    pub conditions: Vec<Value>,
    pub medications: Vec<Value>,
    pub observations: Vec<Value>,
}

impl PatientRecord {
    /// Display name of the patient, if the Patient resource has one.
    #[must_use]
    pub fn patient_name(&self) -> Option<String> {
        Patient::from_value(&self.patient).name
    }

    /// Total number of resources in the record, the Patient included.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        1 + self.conditions.len() + self.medications.len() + self.observations.len()
    }
}
