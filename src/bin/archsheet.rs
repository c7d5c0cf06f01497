//! archsheet CLI Binary
//!
//! Command-line interface for the presentation sheet generation pipeline.

use anyhow::Context;
use archsheet::cli::{Cli, RunContext};
use archsheet::config::ConfigLoader;
use archsheet::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("archsheet starting");

    let context = match RunContext::new(cli.workspace.clone(), cli.config.clone())
        .with_context(|| format!("loading configuration for {}", cli.workspace.display()))
    {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error initializing workspace: {:#}", e);
            eprintln!("{:#}", e);
            process::exit(2);
        }
    };

    match context.execute(&cli.command) {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", archsheet::cli::map_error(&e));
            process::exit(archsheet::cli::exit_code(&e));
        }
    }
}

/// Build logging configuration from CLI args, environment, and config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = ConfigLoader::load_with_file(&cli.workspace, cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();

    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_logging_config_default() {
        let temp = tempfile::tempdir().unwrap();
        let ws = temp.path().to_string_lossy();
        let cli = Cli::try_parse_from(["archsheet", "--workspace", ws.as_ref(), "config", "show"])
            .unwrap();
        let config = build_logging_config(&cli);
        assert!(config.enabled);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_explicit_level_wins_over_verbose() {
        let temp = tempfile::tempdir().unwrap();
        let ws = temp.path().to_string_lossy();
        let cli = Cli::try_parse_from([
            "archsheet",
            "--workspace",
            ws.as_ref(),
            "--verbose",
            "--log-level",
            "warn",
            "config",
            "show",
        ])
        .unwrap();
        assert_eq!(build_logging_config(&cli).level, "warn");
    }
}
