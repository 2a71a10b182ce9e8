//! # Huddle Server
//!
//! Room-based chat relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle
//!
//! # Run with custom config
//! huddle --config /path/to/huddle.toml
//!
//! # Show the effective configuration and exit
//! huddle --print-config
//!
//! # Run with environment variables
//! HUDDLE_PORT=8080 HUDDLE_HOST=0.0.0.0 HUDDLE_DIRECTORY__BACKEND=memory huddle
//! ```

mod config;
mod error;
mod handlers;
mod metrics;
mod store;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Room-based chat relay server
#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(version)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,huddle_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from(["huddle"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.print_config);

        let args =
            Args::try_parse_from(["huddle", "--config", "/tmp/huddle.toml", "--print-config"])
                .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/huddle.toml")));
        assert!(args.print_config);

        let args = Args::try_parse_from(["huddle", "-c", "huddle.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("huddle.toml")));
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(Args::try_parse_from(["huddle", "--config"]).is_err());
        assert!(Args::try_parse_from(["huddle", "--verbose"]).is_err());
    }
}
