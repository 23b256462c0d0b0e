//! Kiln CLI entry point

use clap::Parser;
use console::style;
use kiln::cli::{Cli, Commands};
use kiln::config::ConfigManager;
use kiln::error::{KilnError, KilnResult};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> KilnResult<ExitCode> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let local_config_path = if cli.no_local {
        None
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| KilnError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;

    init_logging(cli.verbose, &config.general.log_format);
    if let Some(path) = &local_config_path {
        debug!("Using local config {}", path.display());
    }

    match cli.command {
        Commands::Run(args) => kiln::cli::commands::run(args, &config).await,
        Commands::Validate(args) => kiln::cli::commands::validate(args).await,
        Commands::Status => kiln::cli::commands::status(&config).await,
        Commands::Config(args) => kiln::cli::commands::config(args, &config_manager, &config).await,
        Commands::Cache(args) => kiln::cli::commands::cache(args, &config).await,
    }
}

fn init_logging(verbose: u8, format: &str) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("kiln=warn"),
        1 => EnvFilter::new("kiln=info"),
        _ => EnvFilter::new("kiln=debug"),
    };

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .without_time()
            .init();
    }
}
