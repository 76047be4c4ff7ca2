//! `scopecfg`: administer and query a scoped configuration store.
//!
//! Reads `scopecfg.toml` (or the path given with `--config`) plus
//! `SCOPECFG__*` environment variables, opens the SQLite store, runs one
//! command and prints its result as JSON.
//!
//! ```text
//! scopecfg define ui.theme.primaryColor --type string --scope persona --default '"#000000"'
//! scopecfg put ui.theme.primaryColor '#1E40AF' --scope persona=rachel
//! scopecfg get ui.theme.primaryColor --persona rachel
//! ```

mod commands;
mod settings;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use scopecfg_engine::ConfigService;
use scopecfg_store_sqlite::SqliteStore;
use settings::Settings;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Scoped configuration store")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "scopecfg.toml")]
  config: PathBuf,

  /// Override the store path from the configuration.
  #[arg(long, env = "SCOPECFG_STORE")]
  store: Option<PathBuf>,

  /// Override the actor recorded on writes.
  #[arg(long)]
  actor: Option<String>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Logs go to stderr so stdout stays valid JSON.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let mut settings = Settings::load(&cli.config)?;
  if let Some(store) = cli.store {
    settings.store_path = settings::expand_tilde(&store);
  }
  if let Some(actor) = cli.actor {
    settings.actor = actor;
  }

  if let Some(parent) = settings.store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  let store = SqliteStore::open(&settings.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;
  tracing::debug!(path = ?settings.store_path, "store opened");

  let service = ConfigService::new(Arc::new(store), settings.engine.clone());
  let output = commands::run(&service, &settings.actor, cli.command).await;

  match output {
    Ok(value) => {
      println!("{}", serde_json::to_string_pretty(&value)?);
      Ok(())
    }
    Err(e) => {
      if let Some(problems) = commands::problems(&e) {
        eprintln!("{}", serde_json::to_string_pretty(&problems)?);
      }
      Err(e)
    }
  }
}
