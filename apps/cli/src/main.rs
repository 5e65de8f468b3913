//! segdl CLI - headless segmented downloader
//!
//! Queues one or more URLs, downloads them one at a time in parallel
//! segments, and exits once the queue drains.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// segdl - Segmented Downloader
#[derive(Parser)]
#[command(name = "segdl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path of the JSON config file
    #[arg(long, env = "SEGDL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download URLs, one after another
    Fetch {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Destination directory
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Declared size in bytes (skips probing, single URL only)
        #[arg(long)]
        size: Option<u64>,

        /// Parallel workers per transfer
        #[arg(short, long)]
        workers: Option<usize>,

        /// Segment size in bytes
        #[arg(long)]
        segment_size: Option<u64>,

        /// Extra query parameter for every ranged read (key=value)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Probe URLs for size and file name
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Print the config file location
    Path,

    /// Reset to defaults
    Reset,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("segdl"))
        .unwrap_or_else(|| PathBuf::from(".segdl"))
        .join("config.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = segdl_core::load_config(&config_path).await?;

    match cli.command {
        Commands::Fetch {
            urls,
            dest,
            size,
            workers,
            segment_size,
            params,
        } => {
            let mut config = config;
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            if let Some(segment_size) = segment_size {
                config.segment_size = segment_size;
            }
            config.extra_params.extend(params);
            commands::fetch(config, urls, dest, size, cli.output).await?
        }

        Commands::Probe { urls } => commands::probe_urls(&config, urls, cli.output).await?,

        Commands::Config { action } => {
            commands::config_action(&config_path, config, action, cli.output).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "segdl", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("token=abc=def").unwrap(),
            ("token".to_string(), "abc=def".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_fetch() {
        let cli = Cli::try_parse_from([
            "segdl", "-v", "fetch", "https://example.com/a.iso", "--workers", "8", "--param", "k=v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Fetch { urls, workers, params, .. } => {
                assert_eq!(urls, vec!["https://example.com/a.iso"]);
                assert_eq!(workers, Some(8));
                assert_eq!(params, vec![("k".to_string(), "v".to_string())]);
            }
            _ => panic!("expected fetch"),
        }
    }
}
