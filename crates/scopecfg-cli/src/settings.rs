//! Layered settings: defaults, then the TOML file, then `SCOPECFG__*`
//! environment variables, then command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use scopecfg_engine::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  /// SQLite database file. A leading `~/` expands to `$HOME`.
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  /// Recorded as `created_by` / `deactivated_by` on writes.
  #[serde(default = "default_actor")]
  pub actor:      String,
  #[serde(default)]
  pub engine:     EngineConfig,
}

fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/scopecfg/scopecfg.db") }

fn default_actor() -> String {
  std::env::var("USER").unwrap_or_else(|_| "scopecfg".to_owned())
}

impl Settings {
  /// Read `path` (if it exists) and the environment.
  ///
  /// Nested keys use a double underscore, e.g.
  /// `SCOPECFG__ENGINE__CACHE__SOFT_TTL_SECS=30`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let raw = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("SCOPECFG")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .with_context(|| format!("failed to read config file {}", path.display()))?;

    let mut settings: Self = raw
      .try_deserialize()
      .context("failed to deserialise settings")?;
    settings.store_path = expand_tilde(&settings.store_path);
    Ok(settings)
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
