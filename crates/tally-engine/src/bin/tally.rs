//! tally binary.
//!
//! Reads `tally.toml` (or the path given with `--config`), opens the SQLite
//! store, and tallies classification events from a JSON-lines spool until
//! interrupted. Retired subjects and their vote fractions are appended to
//! the configured output files.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;
use tally_engine::{
  Engine, EngineConfig, ExportDispatcher,
  jsonl::{JsonlEventSource, JsonlResultsSink, JsonlRetirementSink},
};
use tally_store_sqlite::SqliteStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Classification tally and retirement engine")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tally.toml")]
  config: PathBuf,

  /// Run startup reconciliation, then exit without polling.
  #[arg(long)]
  reconcile_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("TALLY"))
    .build()
    .context("failed to read config file")?;

  let engine_cfg: EngineConfig = settings
    .try_deserialize()
    .context("failed to deserialise EngineConfig")?;
  engine_cfg.validate()?;

  let store_path = expand_tilde(&engine_cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let source = JsonlEventSource::new(expand_tilde(&engine_cfg.events_path), engine_cfg.batch_size);
  let dispatcher = ExportDispatcher::new(
    JsonlRetirementSink::new(expand_tilde(&engine_cfg.retired_path)),
    JsonlResultsSink::new(expand_tilde(&engine_cfg.results_path)),
  );

  let mut engine = Engine::new(store, source, dispatcher, engine_cfg)?;

  if cli.reconcile_only {
    let retired = engine.reconcile().await.context("reconciliation failed")?;
    tracing::info!(retired = retired.len(), "reconciliation complete");
    return Ok(());
  }

  let stats = engine.run(shutdown_signal()).await.context("engine stopped")?;
  tracing::info!(?stats, "exiting");
  Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed the engine runs
/// until killed.
async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => tracing::info!("interrupt received; finishing current batch"),
    Err(e) => {
      tracing::error!(error = %e, "failed to listen for interrupt");
      std::future::pending::<()>().await;
    }
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
