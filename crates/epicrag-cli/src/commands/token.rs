use anyhow::{Context, Result};
use epicrag_auth::TokenCache;
use serde_json::json;
use time::format_description::well_known::Rfc3339;

use crate::cli::OutputFormat;
use crate::output::{print_field, print_json, print_success};

pub async fn token(cache: &TokenCache, format: OutputFormat) -> Result<()> {
    let token = cache
        .get_valid_token()
        .await
        .context("failed to obtain an access token")?;
    let expires_at = token.expires_at().format(&Rfc3339)?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "token": token.preview(),
            "scope": token.scope(),
            "expires_at": expires_at,
            "expires_in": token.lifetime().as_secs(),
        }))?,
        OutputFormat::Table => {
            print_success("Access token acquired");
            print_field("Token", &token.preview());
            print_field("Scope", token.scope().unwrap_or("-"));
            print_field("Expires", &expires_at);
        }
    }
    Ok(())
}
