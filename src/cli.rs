use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "geotech",
    version,
    about = "Store geolocation and soil-report consolidation tooling"
)]
pub struct Cli {
    /// Also write log output to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Inventory(InventoryArgs),
    Ingest(IngestArgs),
    Coords(CoordsArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(long, default_value = "info")]
    pub root: PathBuf,

    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "Consolidado_Tiendas")]
    pub output_stem: String,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = "info")]
    pub root: PathBuf,

    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "Consolidado_Tiendas")]
    pub output_stem: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    #[arg(long, default_value = "gpt-5.2")]
    pub model: String,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 30)]
    pub large_file_threshold_mb: u64,

    #[arg(long, default_value_t = 50)]
    pub text_fallback_max_pages: usize,

    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Process at most this many pending stores, then stop.
    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long)]
    pub run_manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CoordsArgs {
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "info")]
    pub root: PathBuf,

    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "Consolidado_Tiendas")]
    pub output_stem: String,
}
