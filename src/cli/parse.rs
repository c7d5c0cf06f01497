//! CLI parse: clap types for archsheet. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// archsheet - consistency-gated presentation sheet generation
#[derive(Parser)]
#[command(name = "archsheet")]
#[command(about = "Generate consistent multi-panel architectural presentation sheets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (layered above workspace config)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the ordered job plan and seeds without calling any service
    Plan {
        /// Design specification (JSON)
        design: PathBuf,
        /// Comma-separated role sequence (default: full sheet)
        #[arg(long, value_delimiter = ',')]
        roles: Option<Vec<String>>,
        /// Explicit base seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print the seed derived for one role
    Seed {
        /// Design specification (JSON)
        design: PathBuf,
        /// Panel role name
        role: String,
        /// Explicit base seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the full pipeline against the configured services
    Run {
        /// Design specification (JSON)
        design: PathBuf,
        /// Comma-separated role sequence (default: full sheet)
        #[arg(long, value_delimiter = ',')]
        roles: Option<Vec<String>>,
        /// Explicit base seed
        #[arg(long)]
        seed: Option<u64>,
        /// Skip fingerprint extraction and the consistency gate
        #[arg(long)]
        no_fingerprint: bool,
        /// Return the latest baseline when design and plan are unchanged
        #[arg(long)]
        reuse: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Inspect persisted baseline bundles
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum BundleCommands {
    /// Show the latest (or a given) bundle of a design
    Show {
        design_id: String,
        /// Specific run id (default: latest)
        #[arg(long)]
        run: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List persisted runs of a design, oldest first
    List { design_id: String },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}
