use anyhow::Result;
use epicrag_index::VectorStore;

use crate::cli::OutputFormat;
use crate::output::{print_field, print_json};

pub async fn stats(store: &dyn VectorStore, format: OutputFormat) -> Result<()> {
    let stats = store.stats().await?;
    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            print_field("Collection", &stats.collection_name);
            print_field("Documents", &stats.total_documents.to_string());
            print_field("Patients", &stats.patients.to_string());
        }
    }
    Ok(())
}
