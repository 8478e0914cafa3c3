//! Persister CLI - Kafka to InfluxDB metrics persister.

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::run::{Overrides, Stopped};
use persister_core::config::{LogFormat, LogLevel};
use persister_core::{Config, Error};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (unreadable file, invalid TOML, failed validation)
    ConfigError = 1,
    /// Kafka-related error (connection, poll, offset commit)
    KafkaError = 2,
    /// Storage write failed
    StorageError = 3,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by its kind.
    fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) | Some(Error::Io(_)) => ExitCode::ConfigError,
            Some(Error::Kafka(_)) => ExitCode::KafkaError,
            Some(Error::Storage(_)) | Some(Error::Halted) => ExitCode::StorageError,
            _ => ExitCode::RuntimeError,
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "persister")]
#[command(about = "Persist monitoring messages from Kafka into InfluxDB", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume, batch and persist messages
    Run {
        /// Override Kafka bootstrap servers (comma separated)
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override Kafka topic
        #[arg(long)]
        topic: Option<String>,

        /// Override consumer group
        #[arg(long)]
        consumer_group: Option<String>,

        /// Override the number of points that triggers a flush
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show status and health of a running persister
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL (defaults to the health URL on port 9090)
        #[arg(long)]
        metrics_url: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config file when it parses
    let (log_level, log_format) = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| (config.monitoring.log_level, config.monitoring.log_format))
        .unwrap_or((LogLevel::Info, LogFormat::Json));

    init_logging(cli.verbose, log_level, log_format);

    match execute_command(cli).await {
        Ok(Stopped::Completed) => ExitCode::Success,
        Ok(Stopped::Interrupted) => ExitCode::SignalInterrupt,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

fn init_logging(verbose: u8, level: LogLevel, format: LogFormat) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new(level.as_filter()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<Stopped> {
    match cli.command {
        Commands::Run {
            bootstrap_servers,
            topic,
            consumer_group,
            batch_size,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let overrides = Overrides {
                bootstrap_servers,
                topic,
                consumer_group,
                batch_size,
            };
            commands::run::run(config, overrides).await
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, metrics_url.as_deref()).await?;
            Ok(Stopped::Completed)
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            println!("Configuration is valid");
            Ok(Stopped::Completed)
        }
    }
}

/// Read and parse the config file without validating it, so CLI overrides
/// can still fill in missing values.
fn load_config(path: Option<&Path>) -> std::result::Result<Config, Error> {
    let path = path.unwrap_or_else(|| Path::new("config.toml"));
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use persister_core::{KafkaError, StorageError};

    #[test]
    fn test_exit_code_from_error_kind() {
        let cases = [
            (Error::Config("bad".into()), ExitCode::ConfigError),
            (
                Error::Kafka(KafkaError::OffsetCommit("gone".into())),
                ExitCode::KafkaError,
            ),
            (
                Error::Storage(StorageError::Rejected {
                    status: 500,
                    message: "internal".into(),
                }),
                ExitCode::StorageError,
            ),
            (Error::Halted, ExitCode::StorageError),
            (
                Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)),
                ExitCode::ConfigError,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ExitCode::from_error(&anyhow::Error::from(err)), expected);
        }
        assert_eq!(
            ExitCode::from_error(&anyhow::anyhow!("task panicked")),
            ExitCode::RuntimeError
        );
    }

    #[test]
    fn test_load_config_missing_file_is_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/persister.toml"))).unwrap_err();
        let code = ExitCode::from_error(&anyhow::Error::from(err));
        assert_eq!(code, ExitCode::ConfigError);
    }

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "persister",
            "--config",
            "persister.toml",
            "run",
            "--topic",
            "metrics",
            "--batch-size",
            "500",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("persister.toml")));
        match cli.command {
            Commands::Run {
                topic, batch_size, ..
            } => {
                assert_eq!(topic.as_deref(), Some("metrics"));
                assert_eq!(batch_size, Some(500));
            }
            _ => panic!("expected run subcommand"),
        }
    }
}
