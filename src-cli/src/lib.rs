pub mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use indexdeck_core::jobs::StateUpdate;
use indexdeck_core::service::ServiceFixture;
use indexdeck_core::{Config, MemoryIndexService, Settings, UnifiedIndexOrchestrator};

use cli::{Cli, Command};

/// Initialize logging with the given filter directives.
///
/// `RUST_LOG` is honoured; invalid directives are reported and skipped.
pub fn init_logging(directives: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive '{}': {}", directive, e),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse-and-run entry point for the binary.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let directives: Vec<&str> = cli.log.split(',').map(str::trim).collect();
    init_logging(&directives);

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let output = rt.block_on(execute(&cli))?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let path = match &cli.settings {
        Some(path) => path.clone(),
        None => {
            let config = Config::load_or_default();
            config.ensure_dirs()?;
            config.settings_file
        }
    };
    tracing::debug!(path = %path.display(), "Loading settings");
    Ok(Settings::load(&path))
}

fn load_service(cli: &Cli, settings: &Settings) -> anyhow::Result<MemoryIndexService> {
    let fixture = match &cli.fixture {
        Some(path) => ServiceFixture::load(path)?,
        None => ServiceFixture::sample(),
    };
    tracing::info!(resources = fixture.resources.len(), "Seeded index service");

    Ok(MemoryIndexService::from_fixture(fixture)
        .with_channels(&settings.batch_channel, &settings.multimodal_channel)
        .with_item_delay(Duration::from_millis(cli.item_delay_ms)))
}

/// Log job progress as it happens.
fn spawn_progress_logger(mut updates: mpsc::Receiver<StateUpdate>) {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update {
                StateUpdate::Job { channel, state } => {
                    tracing::info!(
                        channel = %channel,
                        phase = ?state.phase,
                        percent = state.progress_percent,
                        "{}",
                        state.message
                    );
                }
                StateUpdate::Summary(summary) => {
                    tracing::debug!(
                        total = summary.total_resources,
                        indexed = summary.indexed_count,
                        pending = summary.pending_count,
                        failed = summary.failed_count,
                        "Snapshot refreshed"
                    );
                }
                StateUpdate::FetchFailed(error) => {
                    tracing::warn!(error = %error, "Snapshot refresh failed");
                }
            }
        }
    });
}

/// Run one command against a freshly seeded service and return its output.
pub async fn execute(cli: &Cli) -> anyhow::Result<Value> {
    let settings = load_settings(cli)?;
    let service = load_service(cli, &settings)?;

    let (orchestrator, updates) = UnifiedIndexOrchestrator::new(Arc::new(service), settings);
    spawn_progress_logger(updates);
    orchestrator.start().await?;

    let result = dispatch(&orchestrator, &cli.command).await;
    orchestrator.shutdown().await;
    result
}

async fn dispatch(orchestrator: &UnifiedIndexOrchestrator, command: &Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Run => {
            let run = orchestrator.run_all().await?;
            orchestrator.refresh().await?;
            json!({
                "run": run,
                "status": status(orchestrator).await?,
            })
        }
        Command::Status => status(orchestrator).await?,
        Command::Diagnose => json!({
            "diagnostic": orchestrator.diagnostic().await?,
            "dimensions": orchestrator.dimensions().await?,
        }),
        Command::Reset { scope } => {
            let affected = orchestrator.reset((*scope).into()).await?;
            json!({
                "affected": affected,
                "status": status(orchestrator).await?,
            })
        }
        Command::Toggle { resource_id } => json!({
            "resourceId": resource_id,
            "state": orchestrator.toggle_disabled(resource_id).await?,
        }),
        Command::Reindex { resource_id } => json!({
            "resourceId": resource_id,
            "chunkCount": orchestrator.reindex(resource_id).await?,
        }),
    };
    Ok(output)
}

async fn status(orchestrator: &UnifiedIndexOrchestrator) -> anyhow::Result<Value> {
    let snapshot = orchestrator.snapshot().await;
    if let Some(error) = &snapshot.fetch_error {
        anyhow::bail!("Index status unavailable: {}", error);
    }
    let (Some(summary), Some(view)) = (snapshot.summary, snapshot.view) else {
        anyhow::bail!("Index status not loaded");
    };

    let ids = |records: &[indexdeck_core::ResourceIndexRecord]| -> Vec<String> {
        records.iter().map(|r| r.resource_id.clone()).collect()
    };

    Ok(json!({
        "totalResources": summary.total_resources,
        "counts": {
            "indexed": summary.indexed_count,
            "pending": summary.pending_count,
            "indexing": summary.indexing_count,
            "failed": summary.failed_count,
            "disabled": summary.disabled_count,
            "stale": summary.stale_count,
        },
        "multimodal": {
            "total": summary.mm_total_resources,
            "indexed": summary.mm_indexed_count,
            "pending": summary.mm_pending_count,
            "failed": summary.mm_failed_count,
        },
        "ratios": view.ratios,
        "groups": {
            "pending": ids(&view.groups.pending),
            "indexing": ids(&view.groups.indexing),
            "indexed": ids(&view.groups.indexed),
            "failed": ids(&view.groups.failed),
            "disabled": ids(&view.groups.disabled),
        },
        "stale": view.stale,
        "batch": snapshot.batch,
        "multimodalJob": snapshot.multimodal,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str], dir: &tempfile::TempDir) -> Cli {
        let settings = dir.path().join("settings.json");
        let mut argv = vec!["indexdeck", "--settings", settings.to_str().unwrap(), "--item-delay-ms", "1"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cli(&["run"], &dir).command, Command::Run);
        assert_eq!(
            cli(&["reset", "no-embeddings"], &dir).command,
            Command::Reset {
                scope: cli::ResetScope::NoEmbeddings
            }
        );
        assert!(Cli::try_parse_from(["indexdeck", "reset", "everything"]).is_err());
    }

    #[tokio::test]
    async fn test_status_on_sample() {
        let dir = tempfile::tempdir().unwrap();
        let output = execute(&cli(&["status"], &dir)).await.unwrap();
        assert_eq!(output["totalResources"], 7);
        assert_eq!(output["counts"]["disabled"], 1);
        assert_eq!(output["batch"]["phase"], "idle");
    }

    #[tokio::test]
    async fn test_run_on_sample() {
        let dir = tempfile::tempdir().unwrap();
        let output = execute(&cli(&["run"], &dir)).await.unwrap();

        assert_eq!(output["run"]["status"], "finished");
        assert_eq!(output["run"]["textRequested"], 4);
        assert_eq!(output["run"]["batch"]["successCount"], 3);
        assert_eq!(output["run"]["batch"]["failCount"], 1);
        assert_eq!(output["status"]["counts"]["pending"], 0);
    }

    #[tokio::test]
    async fn test_fixture_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.json");
        std::fs::write(
            &fixture,
            serde_json::to_string(&ServiceFixture::sample()).unwrap(),
        )
        .unwrap();

        let output = execute(&cli(
            &["--fixture", fixture.to_str().unwrap(), "reset", "disabled"],
            &dir,
        ))
        .await
        .unwrap();
        assert_eq!(output["affected"], 1);
        assert_eq!(output["status"]["counts"]["disabled"], 0);
    }
}
