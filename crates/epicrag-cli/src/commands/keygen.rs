use anyhow::{Context, Result, bail};
use epicrag_auth::GeneratedKeyPair;
use serde_json::json;

use crate::cli::{KeygenArgs, OutputFormat};
use crate::output::{print_field, print_json, print_success, print_warning};

pub async fn keygen(args: &KeygenArgs, format: OutputFormat) -> Result<()> {
    let private_key = args.out_dir.join("private_key.pem");
    if private_key.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            private_key.display()
        );
    }

    let bits = args.bits;
    let pair = tokio::task::spawn_blocking(move || GeneratedKeyPair::generate(bits))
        .await?
        .context("key generation failed")?;
    pair.write_to(&args.out_dir)
        .with_context(|| format!("failed to write keys to {}", args.out_dir.display()))?;

    match format {
        OutputFormat::Json => print_json(&json!({
            "kid": pair.kid,
            "out_dir": args.out_dir,
            "jwks": pair.jwks,
        }))?,
        OutputFormat::Table => {
            print_success(&format!("Generated RSA-{bits} key pair"));
            print_field("Key ID", &pair.kid);
            print_field("Directory", &args.out_dir.display().to_string());
            println!();
            println!("Register jwks.json (or its URL) with your Epic backend app,");
            println!("then set EPIC_KEY_ID={} and EPIC_PRIVATE_KEY_PATH.", pair.kid);
            print_warning("Keep private_key.pem secret.");
        }
    }
    Ok(())
}
