//! CLI command definitions

use clap::Args;
use std::path::PathBuf;

/// Run (or resume) a batch against the simulated agent
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the rules catalog YAML file
    #[arg(short, long)]
    pub rules: PathBuf,

    /// Plan id of the client
    #[arg(long)]
    pub plan: String,

    /// Pay frequency of the pipeline to run
    #[arg(long)]
    pub pay_freq: String,

    /// Vendor file path, relative to --file-root
    #[arg(long)]
    pub source: String,

    /// Directory the source path is resolved against
    #[arg(long, default_value = ".")]
    pub file_root: PathBuf,

    /// Batch id; a new one is generated when omitted. Reuse an id to resume a batch.
    #[arg(long)]
    pub batch_id: Option<String>,

    /// SQLite database holding batch state
    #[arg(long, conflicts_with = "in_memory")]
    pub db: Option<PathBuf>,

    /// Keep batch state in memory only
    #[arg(long)]
    pub in_memory: bool,

    /// Path to a settings YAML file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Make the simulated agent fail every attempt of this step (repeatable)
    #[arg(long = "fail-step")]
    pub fail_steps: Vec<String>,
}

/// Validate every pipeline definition in a rules catalog
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the rules catalog YAML file
    #[arg(short, long)]
    pub rules: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the persisted state of a batch
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Batch to show
    #[arg(long)]
    pub batch_id: String,

    /// SQLite database holding batch state
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
