use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::LoadMode;
use harvest_scrape::{flatten_tasks, TagUrlEncoder};
use harvest_sync::{IngestPipeline, LoadOutcome, RunSummary, SyncConfig, TagRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Hashtag harvest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deep crawl and first load; held to volume and time-span checks.
    Initial,
    /// Shallow crawl merged into the existing table.
    Incremental,
    /// Run the incremental flow on `HARVEST_SYNC_CRON` until interrupted.
    Schedule,
    /// Print the search locator for every configured tag.
    Encode,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Incremental) {
        Commands::Initial => run(config, LoadMode::Initial).await?,
        Commands::Incremental => run(config, LoadMode::Incremental).await?,
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(IngestPipeline::from_config(config)?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Encode => {
            let registry = TagRegistry::load(config.tag_registry_path()).await?;
            let encoder = TagUrlEncoder::new(config.search_url_template.clone());
            let tasks = flatten_tasks(&encoder.encode(&registry.categories));
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
    }

    Ok(())
}

async fn run(config: SyncConfig, mode: LoadMode) -> Result<()> {
    let pipeline = IngestPipeline::from_config(config)?;
    let summary = pipeline.run_once(mode).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let outcome = match &summary.outcome {
        LoadOutcome::Rejected {
            failed_checks,
            row_violations,
        } => format!(
            "rejected (failed checks: [{}], row violations: {row_violations})",
            failed_checks.join(", ")
        ),
        LoadOutcome::Unchanged => "unchanged since last load".to_string(),
        LoadOutcome::NoNewRecords => "no new records".to_string(),
        LoadOutcome::Appended { rows, commit_id } => format!("appended {rows} rows in commit {commit_id}"),
    };
    println!(
        "{} run complete: run_id={} tags={} empty_tags={} entries={} dropped={} -> {}",
        summary.mode,
        summary.run_id,
        summary.tags_total,
        summary.tags_empty,
        summary.normalized,
        summary.dropped_malformed,
        outcome
    );
}
