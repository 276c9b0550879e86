//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use clipscript_core::config::{ClipConfig, init_config, load_config};
use clipscript_core::Collector;
use clipscript_ml::{FineTuneDriver, GenerationDriver, PythonRuntime, check_environment};
use std::io::{IsTerminal, Read};
use std::path::Path;
use tracing::warn;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Check => handle_check(workspace, config_file).await,
        Commands::Collect => handle_collect(workspace, config_file).await,
        Commands::Train { dry_run } => handle_train(workspace, config_file, dry_run).await,
        Commands::Generate {
            summary,
            summary_file,
            raw,
        } => {
            let summary = read_summary(summary, summary_file.as_deref())?;
            handle_generate(workspace, config_file, &summary, raw).await
        }
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

fn load(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<ClipConfig> {
    load_config(Some(workspace), config_file)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn runtime(config: &ClipConfig, workspace: &Path) -> PythonRuntime {
    PythonRuntime::from_config(&config.python, workspace.to_path_buf())
}

async fn handle_check(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = load(workspace, config_file)?;
    let report = check_environment(&runtime(&config, workspace)).await;

    let missing = report.missing_packages();
    if !missing.is_empty() {
        warn!(packages = %missing.join(", "), "Required Python packages are not importable");
    }
    print!("{report}");
    Ok(())
}

async fn handle_collect(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let mut config = load(workspace, config_file)?;
    if config.collector.handles.is_empty() {
        warn!("No handles configured under [collector].handles, nothing to query");
    }
    config.collector.output = workspace.join(&config.collector.output);
    let output = config.collector.output.clone();

    let summary = Collector::new(config.collector)?.run().await?;
    println!(
        "Wrote {} records from {} handles ({} failed) to {}",
        summary.records_written,
        summary.handles_queried,
        summary.handles_failed,
        output.display()
    );
    Ok(())
}

async fn handle_train(
    workspace: &Path,
    config_file: Option<&Path>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let config = load(workspace, config_file)?;
    let runtime = runtime(&config, workspace);
    let driver = FineTuneDriver::new(config, runtime)?;

    if dry_run {
        let run = driver.prepare()?;
        println!(
            "Prepared run {}: {} train / {} eval examples in {}",
            run.plan.run_id,
            run.train_examples,
            run.eval_examples,
            run.staging_dir.display()
        );
        return Ok(());
    }

    let outcome = driver.run().await.context("Fine-tuning failed")?;
    println!("Adapter saved to {}", outcome.adapter.path().display());
    if let Some(loss) = outcome.metrics.train_loss {
        println!("Train loss: {loss:.4}");
    }
    if let Some(loss) = outcome.metrics.eval_loss {
        println!("Eval loss: {loss:.4}");
    }
    Ok(())
}

async fn handle_generate(
    workspace: &Path,
    config_file: Option<&Path>,
    summary: &str,
    raw: bool,
) -> anyhow::Result<()> {
    let config = load(workspace, config_file)?;
    let runtime = runtime(&config, workspace);
    let output = GenerationDriver::new(config, runtime)?
        .generate(summary)
        .await
        .context("Generation failed")?;

    if raw {
        println!("{}", output.raw);
    } else {
        println!("{}", output.reply);
    }
    Ok(())
}

/// Summary from `--summary`, `--summary-file`, or piped stdin.
fn read_summary(summary: Option<String>, summary_file: Option<&Path>) -> anyhow::Result<String> {
    if let Some(summary) = summary {
        return Ok(summary);
    }
    if let Some(path) = summary_file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read summary file {}", path.display()));
    }

    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        anyhow::bail!("No news summary given: use --summary, --summary-file, or pipe it on stdin");
    }
    let mut buf = String::new();
    stdin
        .read_to_string(&mut buf)
        .context("Failed to read summary from stdin")?;
    Ok(buf)
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            match init_config(workspace)? {
                Some(path) => println!("Created default configuration at: {}", path.display()),
                None => println!(
                    "Configuration file already exists at: {}",
                    workspace
                        .join(clipscript_core::config::CONFIG_FILE_NAME)
                        .display()
                ),
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file)?;
            let toml_str = toml::to_string_pretty(&config.redacted())?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
