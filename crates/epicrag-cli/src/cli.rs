use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "epicrag")]
#[command(about = "Index Epic FHIR patient records and ask questions about them")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./epicrag.toml when present)
    #[arg(short, long, global = true, env = "EPICRAG_CONFIG")]
    pub config: Option<String>,

    /// Log level or filter directive (overrides logging.level)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an RSA key pair and the JWKS to register with Epic
    Keygen(KeygenArgs),
    /// Request an access token and show its expiry
    Token,
    /// Fetch all records of a patient
    Fetch(FetchArgs),
    /// Fetch and index patients into the vector store
    Index(IndexArgs),
    /// Ask a question about a patient's records
    Ask(AskArgs),
    /// Show the records most relevant to a query
    Search(SearchArgs),
    /// Show vector store statistics
    Stats,
}

#[derive(clap::Args)]
pub struct KeygenArgs {
    /// Directory for private_key.pem, public_key.pem and jwks.json
    #[arg(short, long, default_value = "./keys")]
    pub out_dir: PathBuf,

    /// RSA modulus size
    #[arg(long, default_value_t = epicrag_auth::keys::DEFAULT_KEY_BITS)]
    pub bits: usize,

    /// Overwrite existing key files
    #[arg(long)]
    pub force: bool,
}

#[derive(clap::Args)]
pub struct FetchArgs {
    /// FHIR Patient id
    pub patient: String,
}

#[derive(clap::Args)]
pub struct IndexArgs {
    /// Patient ids (defaults to TEST_PATIENT_ID_LIST / patients.ids)
    pub patients: Vec<String>,
}

#[derive(clap::Args)]
pub struct AskArgs {
    /// FHIR Patient id
    #[arg(short, long)]
    pub patient: String,

    /// Question; omit to start an interactive session
    pub question: Option<String>,

    /// Also print the retrieved context
    #[arg(long)]
    pub show_context: bool,
}

#[derive(clap::Args)]
pub struct SearchArgs {
    /// FHIR Patient id
    #[arg(short, long)]
    pub patient: String,

    /// Search text
    pub query: String,

    /// Number of results
    #[arg(short = 'n', long, default_value_t = 5)]
    pub limit: usize,

    /// Restrict to one resource type (e.g. Condition)
    #[arg(short = 't', long)]
    pub resource_type: Option<String>,
}
