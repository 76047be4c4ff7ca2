//! [`ConfigService`]: the public face of the engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::Stream;
use scopecfg_core::{
  Error, Result,
  clock::{Clock, SystemClock},
  key::{ConfigKeyDefinition, KeyFilter, KeyPatch, NewKeyDefinition},
  record::{ConfigValueRecord, Resolution},
  resolve::resolve,
  scope::{Scope, ScopeContext},
  store::ConfigStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
  bulk::{self, BulkItem},
  cache::{CacheStats, Lookup, ResolutionCache},
  config::EngineConfig,
  coordinator::WriteCoordinator,
  registry::KeyRegistry,
  transfer::{self, ExportDocument, ExportFilter, ImportMode},
};

/// A single-value write request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutValue {
  pub key:            String,
  #[serde(default)]
  pub scope:          Scope,
  pub value:          Value,
  /// Defaults to now.
  #[serde(default)]
  pub effective_from: Option<DateTime<Utc>>,
}

impl PutValue {
  pub fn new(key: impl Into<String>, scope: Scope, value: Value) -> Self {
    Self {
      key: key.into(),
      scope,
      value,
      effective_from: None,
    }
  }

  pub fn effective_from(mut self, at: DateTime<Utc>) -> Self {
    self.effective_from = Some(at);
    self
  }
}

/// Cheap to clone; all clones share the same caches and lock table.
pub struct ConfigService<S> {
  inner: Arc<Inner<S>>,
}

struct Inner<S> {
  store:       Arc<S>,
  clock:       Arc<dyn Clock>,
  config:      EngineConfig,
  registry:    KeyRegistry<S>,
  cache:       Arc<ResolutionCache>,
  coordinator: WriteCoordinator<S>,
  refreshing:  DashSet<(String, ScopeContext)>,
}

impl<S> Clone for ConfigService<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: ConfigStore + 'static> ConfigService<S> {
  pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
    Self::with_clock(store, config, Arc::new(SystemClock))
  }

  pub fn with_clock(
    store: Arc<S>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let cache = Arc::new(ResolutionCache::new(&config.cache));
    let registry = KeyRegistry::new(Arc::clone(&store), config.list_page_size);
    let coordinator = WriteCoordinator::new(
      Arc::clone(&store),
      Arc::clone(&cache),
      config.write_attempts,
    );
    Self {
      inner: Arc::new(Inner {
        store,
        clock,
        config,
        registry,
        cache,
        coordinator,
        refreshing: DashSet::new(),
      }),
    }
  }

  pub fn config(&self) -> &EngineConfig { &self.inner.config }

  pub fn now(&self) -> DateTime<Utc> { self.inner.clock.now() }

  pub fn cache_stats(&self) -> CacheStats { self.inner.cache.stats() }

  /// Drop all cached resolutions and definitions.
  pub fn flush_cache(&self) {
    self.inner.cache.clear();
    self.inner.registry.clear();
    tracing::debug!("caches flushed");
  }

  // ── Registry ──────────────────────────────────────────────────────────

  pub async fn define_key(
    &self,
    new: NewKeyDefinition,
  ) -> Result<ConfigKeyDefinition> {
    let def = self.inner.registry.define(new, self.now()).await?;
    tracing::info!(key = %def.key, declared_type = %def.declared_type, "key defined");
    Ok(def)
  }

  pub async fn get_key(&self, key: &str) -> Result<ConfigKeyDefinition> {
    self.inner.registry.get(key).await
  }

  pub fn list_keys(
    &self,
    filter: KeyFilter,
  ) -> impl Stream<Item = Result<ConfigKeyDefinition>> + Send + '_ {
    self.inner.registry.list(filter)
  }

  pub async fn update_key(
    &self,
    key: &str,
    patch: KeyPatch,
  ) -> Result<ConfigKeyDefinition> {
    let def = self.inner.registry.update(key, patch, self.now()).await?;
    self.inner.cache.invalidate(key);
    tracing::info!(key, "key updated");
    Ok(def)
  }

  pub async fn remove_key(&self, key: &str) -> Result<()> {
    self.inner.registry.remove(key).await?;
    self.inner.cache.invalidate(key);
    tracing::info!(key, "key removed");
    Ok(())
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// The effective value of `key` for `ctx`, served from cache when
  /// possible.
  pub async fn get_value(
    &self,
    key: &str,
    ctx: &ScopeContext,
  ) -> Result<Resolution> {
    let ctx = ctx.clone().normalized();
    match self.inner.cache.lookup(key, &ctx, self.now()) {
      Lookup::Fresh(resolution) => {
        tracing::debug!(key, ?ctx, "cache hit");
        return Ok(resolution);
      }
      Lookup::Stale(resolution) if self.inner.config.cache.background_refresh => {
        tracing::debug!(key, ?ctx, "cache stale, refreshing in background");
        if self.spawn_refresh(key, &ctx) {
          return Ok(resolution);
        }
      }
      Lookup::Stale(_) => tracing::debug!(key, ?ctx, "cache stale"),
      Lookup::Miss => tracing::debug!(key, ?ctx, "cache miss"),
    }
    self.inner.resolve_and_cache(key, &ctx).await
  }

  /// Resolve as of an arbitrary instant, bypassing the cache.
  pub async fn get_value_as_of(
    &self,
    key: &str,
    ctx: &ScopeContext,
    as_of: DateTime<Utc>,
  ) -> Result<Resolution> {
    let def = self.inner.registry.get(key).await?;
    let ctx = ctx.clone().normalized();
    let resolved = resolve(self.inner.store.as_ref(), &def, &ctx, as_of).await?;
    Ok(resolved.resolution)
  }

  /// Every version stored for one tuple, newest first.
  pub async fn get_history(
    &self,
    key: &str,
    scope: &Scope,
  ) -> Result<Vec<ConfigValueRecord>> {
    self.inner.registry.get(key).await?;
    self
      .inner
      .store
      .history(key, scope)
      .await
      .map_err(Error::store)
  }

  // ── Writes ────────────────────────────────────────────────────────────

  pub async fn put_value(
    &self,
    put: PutValue,
    created_by: &str,
  ) -> Result<ConfigValueRecord> {
    let def = self.inner.registry.get(&put.key).await?;
    let now = self.now();
    self
      .inner
      .coordinator
      .write(
        &def,
        put.scope,
        put.value,
        put.effective_from.unwrap_or(now),
        now,
        created_by,
      )
      .await
      .inspect_err(|e| self.forget_changed(e))
  }

  pub async fn deactivate_value(
    &self,
    record_id: Uuid,
    actor: &str,
  ) -> Result<ConfigValueRecord> {
    self
      .inner
      .coordinator
      .deactivate(record_id, self.now(), actor)
      .await
  }

  /// Write every item or none of them.
  pub async fn bulk_put(
    &self,
    items: Vec<BulkItem>,
    created_by: &str,
  ) -> Result<Vec<ConfigValueRecord>> {
    let records =
      bulk::prepare(&self.inner.registry, items, self.now(), created_by).await?;
    self
      .inner
      .coordinator
      .commit(records)
      .await
      .inspect_err(|e| self.forget_changed(e))
  }

  // ── Transfer ──────────────────────────────────────────────────────────

  pub async fn export(&self, filter: &ExportFilter) -> Result<ExportDocument> {
    let doc = transfer::export(
      &self.inner.registry,
      self.inner.store.as_ref(),
      filter,
      self.now(),
    )
    .await?;
    tracing::info!(entries = doc.entries.len(), "export built");
    Ok(doc)
  }

  /// Validate the whole document, then define missing keys (if `mode`
  /// allows) and write every value effective now, in one transaction.
  pub async fn import(
    &self,
    doc: ExportDocument,
    mode: ImportMode,
    created_by: &str,
  ) -> Result<Vec<ConfigValueRecord>> {
    let now = self.now();
    let plan = transfer::plan_import(
      &self.inner.registry,
      doc,
      mode,
      now,
      created_by,
    )
    .await?;

    let written = self
      .inner
      .coordinator
      .apply(plan.define, plan.records)
      .await
      .inspect_err(|e| self.forget_changed(e))?;
    tracing::info!(values = written.len(), "import applied");
    Ok(written)
  }

  /// A key redefined elsewhere invalidates our cached copy of it.
  fn forget_changed(&self, err: &Error) {
    if let Error::DefinitionChanged(key) = err {
      tracing::debug!(key = %key, "cached definition out of date");
      self.inner.registry.forget(key);
      self.inner.cache.invalidate(key);
    }
  }

  /// Schedule a background re-resolution of `(key, ctx)`. Returns `false`
  /// when no runtime is available to run it.
  fn spawn_refresh(&self, key: &str, ctx: &ScopeContext) -> bool {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      return false;
    };
    let slot = (key.to_owned(), ctx.clone());
    if !self.inner.refreshing.insert(slot.clone()) {
      // Already being refreshed.
      return true;
    }
    let inner = Arc::clone(&self.inner);
    handle.spawn(async move {
      let (key, ctx) = &slot;
      if let Err(e) = inner.resolve_and_cache(key, ctx).await {
        tracing::warn!(key = %key, error = %e, "background refresh failed");
      }
      inner.refreshing.remove(&slot);
    });
    true
  }
}

impl<S: ConfigStore> Inner<S> {
  async fn resolve_and_cache(
    &self,
    key: &str,
    ctx: &ScopeContext,
  ) -> Result<Resolution> {
    let generation = self.cache.generation(key);
    let def = self.registry.get(key).await?;
    let now = self.clock.now();
    let resolved = resolve(self.store.as_ref(), &def, ctx, now).await?;
    let stored = self.cache.insert(
      key,
      ctx.clone(),
      resolved.resolution.clone(),
      resolved.next_change,
      generation,
      now,
    );
    if !stored {
      tracing::debug!(key, "resolution raced a write, not cached");
    }
    Ok(resolved.resolution)
  }
}
