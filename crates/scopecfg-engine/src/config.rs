//! Engine tuning knobs, deserialised from the `[engine]` table of the
//! binary's configuration.

use serde::{Deserialize, Serialize};

/// Resolution cache timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Age after which a cached value is served but refreshed.
  pub soft_ttl_secs:      u64,
  /// Age after which a cached value must be recomputed before serving.
  pub hard_ttl_secs:      u64,
  /// Refresh soft-stale entries on a background task instead of inline.
  pub background_refresh: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      soft_ttl_secs:      5 * 60,
      hard_ttl_secs:      10 * 60,
      background_refresh: true,
    }
  }
}

impl CacheConfig {
  pub fn soft_ttl(&self) -> chrono::Duration { secs(self.soft_ttl_secs) }

  /// Never shorter than the soft TTL.
  pub fn hard_ttl(&self) -> chrono::Duration {
    secs(self.hard_ttl_secs.max(self.soft_ttl_secs))
  }
}

fn secs(n: u64) -> chrono::Duration {
  chrono::Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1_000))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub cache:          CacheConfig,
  /// Attempts per write before a version conflict is surfaced.
  pub write_attempts: u32,
  /// Definitions fetched per page when listing keys.
  pub list_page_size: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      cache:          CacheConfig::default(),
      write_attempts: 3,
      list_page_size: 100,
    }
  }
}
