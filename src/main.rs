//! flowmint-exec command line
//!
//! - `score`: run the risk gate over a request and a quote, print the assessment
//! - `health`: probe every RPC endpoint once, print health and pool stats
//! - `metrics`: print the Prometheus exposition text

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowmint_exec::config::AppConfig;
use flowmint_exec::observability::init_logging;
use flowmint_exec::{Quote, ServiceContainer, SwapRequest};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FLOWMINT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score a swap request against a quote
    Score {
        /// Swap request JSON
        #[arg(long)]
        request: PathBuf,

        /// Aggregator quote JSON
        #[arg(long)]
        quote: PathBuf,
    },
    /// Probe all RPC endpoints once
    Health,
    /// Print metrics in the text exposition format
    Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.json)?;

    let config = load_config(args.config.as_deref())?;
    let services = ServiceContainer::build(config).await?;

    match args.command {
        Command::Score { request, quote } => {
            let request: SwapRequest = read_json(&request).await?;
            let quote: Quote = read_json(&quote).await?;

            if let Err(reason) = services.risk.quick_check(&request) {
                warn!(code = %reason.code, "Quick check failed: {}", reason.message);
            }
            let assessment = services.risk.score_swap(&request, &quote).await;
            println!("{}", serde_json::to_string_pretty(&assessment)?);
        }
        Command::Health => {
            let healthy = services.rpc.probe_all().await;
            info!(healthy, total = services.rpc.len(), "Probe finished");
            let report = json!({
                "endpoints": services.rpc.get_health_status(),
                "stats": services.rpc.get_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Metrics => {
            print!("{}", services.metrics.render());
        }
    }

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(path) if !path.exists() => {
            warn!("Config file '{}' not found, using defaults", path.display());
            None
        }
        other => other,
    };
    AppConfig::load(path).context("Failed to load configuration")
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_score() {
        let args = Args::try_parse_from([
            "flowmint-exec",
            "-v",
            "score",
            "--request",
            "r.json",
            "--quote",
            "q.json",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Command::Score { request, quote } => {
                assert_eq!(request, PathBuf::from("r.json"));
                assert_eq!(quote, PathBuf::from("q.json"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/flowmint.toml"))).unwrap();
        assert!(!config.rpc.endpoints.is_empty());
    }
}
