use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "kyp-reembed",
    version,
    about = "Risk-summary import and vector re-embedding tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load risk summaries from application data into the record store
    Import(ImportArgs),
    /// Recompute embeddings for every risk summary and upsert them
    Reembed(ReembedArgs),
    /// Report record store and vector index state
    Status(StatusArgs),
    /// Rewrite flat category scores into {score, note} objects
    Normalize(NormalizeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    #[arg(long, default_value = ".cache/kyp")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value = "app/data/applications.json")]
    pub applications_path: PathBuf,

    #[arg(long, default_value = "app/data/risk")]
    pub risk_dir: PathBuf,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct NormalizeArgs {
    /// Rewrite files, keeping `.bak.<timestamp>` copies; without this flag
    /// nothing is written
    #[arg(long, default_value_t = false, conflicts_with = "dry_run")]
    pub apply: bool,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[arg(long, default_value = "app/data/applications.json")]
    pub applications_path: PathBuf,

    #[arg(long, default_value = "app/data/risk")]
    pub risk_dir: PathBuf,

    /// Also normalize `<risk-dir>/<id>.json` files
    #[arg(long, default_value_t = false)]
    pub patch_risk_files: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProviderKind {
    Local,
    Openai,
    Azure,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Openai => "openai",
            Self::Azure => "azure",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReembedArgs {
    /// Write new vectors; without this flag the run only reports
    #[arg(long, default_value_t = false, conflicts_with = "dry_run")]
    pub apply: bool,

    /// Report what would be re-embedded (the default)
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[arg(long, default_value = ".cache/kyp")]
    pub cache_root: PathBuf,

    /// Record store (defaults to <cache-root>/risk_store.sqlite)
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Vector index (defaults to <cache-root>/vector_index.sqlite)
    #[arg(long)]
    pub index_path: Option<PathBuf>,

    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Records per page and per index transaction
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long, env = "KYP_REEMBED_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,

    #[arg(long, default_value_t = 8_000)]
    pub max_backoff_ms: u64,

    /// Abort once this many records in a row exhaust their retries (0 = never)
    #[arg(long, default_value_t = 5)]
    pub max_consecutive_failures: usize,

    #[arg(long, value_enum, env = "KYP_EMBED_PROVIDER", default_value_t = ProviderKind::Local)]
    pub provider: ProviderKind,

    #[arg(long, env = "KYP_EMBED_MODEL")]
    pub model_id: Option<String>,

    #[arg(long, env = "KYP_EMBED_DIMENSIONS")]
    pub dimensions: Option<usize>,

    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(long, env = "AZURE_OPENAI_API_KEY", hide_env_values = true)]
    pub azure_api_key: Option<String>,

    #[arg(long, env = "AZURE_OPENAI_ENDPOINT")]
    pub azure_endpoint: Option<String>,

    #[arg(long, env = "AZURE_OPENAI_EMBEDDING_DEPLOYMENT")]
    pub azure_deployment: Option<String>,

    #[arg(long, env = "AZURE_OPENAI_API_VERSION", default_value = "2024-05-01-preview")]
    pub azure_api_version: String,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/kyp")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub index_path: Option<PathBuf>,

    /// Provider whose default model the index is compared against
    #[arg(long, value_enum, env = "KYP_EMBED_PROVIDER", default_value_t = ProviderKind::Local)]
    pub provider: ProviderKind,

    #[arg(long, env = "KYP_EMBED_MODEL")]
    pub model_id: Option<String>,

    #[arg(long, env = "AZURE_OPENAI_EMBEDDING_DEPLOYMENT")]
    pub azure_deployment: Option<String>,
}
