use anyhow::{Result, bail};
use epicrag_fhir::ResourceType;
use epicrag_index::{EmbeddingProvider, QueryFilter, VectorStore};

use crate::cli::{OutputFormat, SearchArgs};
use crate::output::{print_json, print_table, truncate};

pub async fn search(
    embeddings: &dyn EmbeddingProvider,
    store: &dyn VectorStore,
    args: &SearchArgs,
    format: OutputFormat,
) -> Result<()> {
    if args.query.trim().is_empty() {
        bail!("query is empty");
    }
    let mut filter = QueryFilter::patient(&args.patient);
    if let Some(resource_type) = &args.resource_type {
        let resource_type: ResourceType = resource_type.parse()?;
        filter = filter.with_resource_type(resource_type.as_str());
    }

    let embedding = embeddings.embed_one(&args.query).await?;
    let hits = store.query(&embedding, args.limit.max(1), &filter).await?;

    match format {
        OutputFormat::Json => print_json(&hits)?,
        OutputFormat::Table => {
            let rows = hits
                .iter()
                .map(|h| {
                    [
                        format!("{:.3}", h.score),
                        h.metadata.resource_type.clone(),
                        h.metadata.resource_id.clone(),
                        h.metadata.date.clone().unwrap_or_else(|| "-".to_string()),
                        truncate(&h.text, 80),
                    ]
                })
                .collect();
            print_table(["Score", "Type", "ID", "Date", "Text"], rows);
        }
    }
    Ok(())
}
