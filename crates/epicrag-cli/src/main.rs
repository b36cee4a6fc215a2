mod cli;
mod commands;
mod output;
mod services;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use epicrag_cli::config::{AppConfig, loader::load_config};
use epicrag_cli::observability::init_tracing_with_level;
use output::print_error;

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let cli = Cli::parse();
    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            print_error(&format!("Configuration error: {e}"));
            std::process::exit(2);
        }
    };
    init_tracing_with_level(cli.log_level.as_deref().unwrap_or(&cfg.logging.level));

    if let Err(e) = run(cli, cfg).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cfg: AppConfig) -> Result<()> {
    let format = cli.format.unwrap_or_default();

    match &cli.command {
        Commands::Keygen(args) => {
            commands::keygen::keygen(args, format).await?;
        }
        Commands::Token => {
            let tokens = services::token_cache(&cfg)?;
            commands::token::token(&tokens, format).await?;
        }
        Commands::Fetch(args) => {
            let fetcher = services::fetcher(&cfg, services::token_cache(&cfg)?)?;
            commands::fetch::fetch(&fetcher, &args.patient, format).await?;
        }
        Commands::Index(args) => {
            let patients = if args.patients.is_empty() {
                cfg.patients.ids.clone()
            } else {
                args.patients.clone()
            };
            let fetcher = services::fetcher(&cfg, services::token_cache(&cfg)?)?;
            let indexer = services::indexer(&cfg).await?;
            commands::index::index(&fetcher, &indexer, &patients, format).await?;
        }
        Commands::Ask(args) => {
            let qa = services::retrieval_qa(&cfg).await?;
            commands::ask::ask(&qa, args, format).await?;
        }
        Commands::Search(args) => {
            let embeddings = services::embeddings(&cfg)?;
            let store = services::store(&cfg).await?;
            commands::search::search(embeddings.as_ref(), store.as_ref(), args, format).await?;
        }
        Commands::Stats => {
            let store = services::store(&cfg).await?;
            commands::stats::stats(store.as_ref(), format).await?;
        }
    }
    Ok(())
}
