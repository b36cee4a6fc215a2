use anyhow::{Context, Result};
use colored::Colorize;
use epicrag_fhir::{Condition, FhirFetcher, MedicationRequest, Observation, Patient};

use crate::cli::OutputFormat;
use crate::output::{print_field, print_json, print_table, truncate};

pub async fn fetch(fetcher: &FhirFetcher, patient_id: &str, format: OutputFormat) -> Result<()> {
    let record = fetcher
        .fetch_all_patient_data(patient_id)
        .await
        .with_context(|| format!("failed to fetch patient {patient_id}"))?;

    if let OutputFormat::Json = format {
        return print_json(&record);
    }

    let patient = Patient::from_value(&record.patient);
    println!("{} {}", "Patient:".cyan(), patient.name.as_deref().unwrap_or(patient_id));
    print_field("Gender", patient.gender.as_deref().unwrap_or("-"));
    print_field("Birth date", patient.birth_date.as_deref().unwrap_or("-"));

    let dash = || "-".to_string();
    let mut rows = Vec::with_capacity(record.resource_count());
    for c in record.conditions.iter().map(Condition::from_value) {
        rows.push([
            "Condition".to_string(),
            c.id.unwrap_or_else(dash),
            truncate(c.display.as_deref().unwrap_or("-"), 48),
            c.clinical_status.unwrap_or_else(dash),
            c.onset.unwrap_or_else(dash),
        ]);
    }
    for m in record.medications.iter().map(MedicationRequest::from_value) {
        rows.push([
            "MedicationRequest".to_string(),
            m.id.unwrap_or_else(dash),
            truncate(m.display.as_deref().unwrap_or("-"), 48),
            m.status.unwrap_or_else(dash),
            m.authored_on.unwrap_or_else(dash),
        ]);
    }
    for o in record.observations.iter().map(Observation::from_value) {
        rows.push([
            "Observation".to_string(),
            o.id.unwrap_or_else(dash),
            truncate(o.display.as_deref().unwrap_or("-"), 48),
            o.value.unwrap_or_else(dash),
            o.effective.unwrap_or_else(dash),
        ]);
    }
    print_table(["Type", "ID", "Description", "Status/Value", "Date"], rows);
    println!(
        "Conditions: {}  Medications: {}  Observations: {}",
        record.conditions.len(),
        record.medications.len(),
        record.observations.len()
    );
    Ok(())
}
