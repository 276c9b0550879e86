//! clipscript CLI: collect transcripts, fine-tune, and generate short-form
//! video scripts.
//!
//! Each subcommand runs one step of the workflow; the operator runs them in
//! order.

mod commands;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// clipscript: QLoRA short-form video script workflow
#[derive(Parser, Debug)]
#[command(name = "clipscript", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Report accelerator availability and required Python packages
    Check,
    /// Query the research API for every configured handle and append to the CSV
    Collect,
    /// QLoRA fine-tune the base model on the configured dataset
    Train {
        /// Only format the dataset and write the run plan
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a video script from a news summary
    Generate {
        /// News summary text
        #[arg(short, long, conflicts_with = "summary_file")]
        summary: Option<String>,

        /// Read the news summary from a file
        #[arg(long)]
        summary_file: Option<PathBuf>,

        /// Print the raw decode instead of the extracted reply
        #[arg(long)]
        raw: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to the workspace
    Init,
    /// Print the merged configuration with secrets redacted
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "clipscript", "clipscript")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "clipscript.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = resolve_workspace(&cli.workspace)?;

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}

fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    let workspace = path
        .canonicalize()
        .with_context(|| format!("Workspace directory {} does not exist", path.display()))?;
    if !workspace.is_dir() {
        anyhow::bail!("Workspace {} is not a directory", path.display());
    }
    Ok(workspace)
}
