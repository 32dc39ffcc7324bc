//! capingest entry point.
//!
//! Provides a command-line interface to the capture ingestion pipeline,
//! handling configuration loading and initializing the logging subsystem.
//!
//! The config file path can be given on the command line or through the
//! `CAPINGEST_CONFIG` environment variable.

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use capingest::{
    config::Config,
    errors::{Error, Result},
    ingest::cli::{IngestArgs, PlanArgs, SynthArgs},
    metrics,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// capingest - parallel packet capture ingestion.
///
/// Splits a capture into chunks, decodes them concurrently with an external
/// decoder and merges the results into one time-ordered record stream.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "CAPINGEST_CONFIG",
        default_value = "/etc/capingest/config.yml"
    )]
    config: PathBuf,

    /// Log level.
    #[arg(long, value_name = "LEVEL", default_value = "")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a capture file and print a summary
    Ingest(IngestArgs),

    /// Show how a capture file would be chunked
    Plan(PlanArgs),

    /// Write a synthetic text capture for use with `ingest --simulate`
    Synth(SynthArgs),
}

/// Application entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let log_level = if cli.log_level.is_empty() {
        config.log.level.clone()
    } else {
        cli.log_level.clone()
    };
    setup_logging(&log_level)?;
    cli_main(cli, config).await
}

pub async fn cli_main(cli: Cli, config: Config) -> Result<()> {
    metrics::init_metrics();
    match cli.command {
        Commands::Ingest(args) => args.run(&config).await?,
        Commands::Plan(args) => args.run(&config).await?,
        Commands::Synth(args) => args.run(&config).await?,
    }
    Ok(())
}

/// Configures the logging subsystem based on the specified log level. Logs go to stderr.
///
/// # Arguments
/// * `level` - String representation of the desired log level
fn setup_logging(level: &str) -> Result<()> {
    let filter: EnvFilter = format!("capingest={level}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid log level {level:?}: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{cli_main, Cli};
    use clap::Parser;
    use capingest::config::Config;

    #[tokio::test]
    async fn end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.txt");
        let capture = capture.to_str().unwrap();
        let config = Config::embedded_default().unwrap();

        let cli = Cli::parse_from(vec!["capingest", "synth", capture, "--records", "2000"]);
        assert!(cli_main(cli, config.clone()).await.is_ok());

        let cli = Cli::parse_from(vec!["capingest", "plan", capture, "--cores", "4"]);
        assert!(cli_main(cli, config.clone()).await.is_ok());

        let cli = Cli::parse_from(vec![
            "capingest",
            "ingest",
            capture,
            "--simulate",
            "--chunks",
            "4",
            "--summary-json",
        ]);
        assert!(cli_main(cli, config).await.is_ok());
    }
}
