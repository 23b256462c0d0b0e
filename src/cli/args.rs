//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Kiln - lazy content-addressed build and service executor
///
/// Evaluates operation graphs inside rootless sandboxes, reusing every
/// result it has computed before.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .kiln.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate a graph document
    Run(RunArgs),

    /// Check a graph document without running it
    Validate(ValidateArgs),

    /// Check runtime availability and show engine state
    Status,

    /// Show or edit configuration
    Config(ConfigArgs),

    /// Manage the operation cache and content store
    Cache(CacheArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Graph document (.json or .toml)
    pub graph: PathBuf,

    /// Root operations to evaluate (defaults to the graph's roots)
    #[arg(short, long = "root", value_name = "ID")]
    pub roots: Vec<String>,

    /// Session name (auto-generated if not provided)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Stop at breakpoints and failures for inspection
    #[arg(short, long)]
    pub debug: bool,

    /// Output format for the result report
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Graph document (.json or .toml)
    pub graph: PathBuf,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., engine.max_parallel)
        key: String,
        /// Value to set
        value: String,
        /// Write to project-local .kiln.toml instead of global config
        #[arg(long)]
        local: bool,
    },
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show cache and store usage
    Stats {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove entries not used for a number of days
    Gc {
        /// Remove entries older than N days (default: from config)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Re-hash every cached result and drop corrupt entries
    Verify,

    /// Remove every cache entry
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
