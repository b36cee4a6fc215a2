use anyhow::{Result, bail};
use epicrag_fhir::FhirFetcher;
use epicrag_index::{IndexReport, Indexer};

use crate::cli::OutputFormat;
use crate::output::{print_error, print_json, print_success, print_table};

/// Fetches and indexes each patient in turn. A failing patient does not stop
/// the others, but the command fails if any patient did.
pub async fn index(
    fetcher: &FhirFetcher,
    indexer: &Indexer,
    patients: &[String],
    format: OutputFormat,
) -> Result<()> {
    if patients.is_empty() {
        bail!("no patients given (pass ids or set TEST_PATIENT_ID_LIST)");
    }

    let mut reports: Vec<IndexReport> = Vec::with_capacity(patients.len());
    let mut failed = 0usize;
    for patient_id in patients {
        let outcome = match fetcher.fetch_all_patient_data(patient_id).await {
            Ok(record) => indexer.index_patient(&record).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(report) => {
                if let OutputFormat::Table = format {
                    print_success(&format!(
                        "{patient_id}: {} chunks indexed",
                        report.indexed
                    ));
                }
                reports.push(report);
            }
            Err(e) => {
                tracing::error!(patient_id = %patient_id, error = %e, "Indexing failed");
                print_error(&format!("{patient_id}: {e:#}"));
                failed += 1;
            }
        }
    }

    match format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Table => {
            let rows = reports
                .iter()
                .map(|r| {
                    let count = |t: &str| r.by_type.get(t).copied().unwrap_or(0).to_string();
                    [
                        r.patient_id.clone(),
                        count("Condition"),
                        count("MedicationRequest"),
                        count("Observation"),
                        r.indexed.to_string(),
                        r.replaced.to_string(),
                    ]
                })
                .collect();
            print_table(
                ["Patient", "Conditions", "Medications", "Observations", "Indexed", "Replaced"],
                rows,
            );
        }
    }

    if failed > 0 {
        bail!("{failed} of {} patients failed to index", patients.len());
    }
    Ok(())
}
