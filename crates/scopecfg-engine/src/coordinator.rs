//! Serialised writes per `(key, scope)` tuple.
//!
//! Each tuple has its own async mutex so writers on unrelated tuples never
//! wait on each other. Locks for a multi-tuple batch are taken in sorted
//! order. The store's version constraint still backs all of this up for
//! writers in other processes; a conflict it reports is retried here.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scopecfg_core::{
  Error, Result,
  key::ConfigKeyDefinition,
  record::{ConfigValueRecord, NewRecord},
  scope::Scope,
  store::{AppendOutcome, ConfigStore},
};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::cache::ResolutionCache;

type Tuple = (String, Scope);
type LockTable = DashMap<Tuple, Arc<Mutex<()>>>;

pub struct WriteCoordinator<S> {
  store:        Arc<S>,
  cache:        Arc<ResolutionCache>,
  locks:        LockTable,
  max_attempts: u32,
}

/// Held tuple locks. Dropping releases them and prunes idle table entries.
struct TupleLocks<'a> {
  table: &'a LockTable,
  held:  Vec<(Tuple, OwnedMutexGuard<()>)>,
}

impl Drop for TupleLocks<'_> {
  fn drop(&mut self) {
    for (tuple, guard) in self.held.drain(..) {
      drop(guard);
      self
        .table
        .remove_if(&tuple, |_, lock| Arc::strong_count(lock) == 1);
    }
  }
}

impl<S: ConfigStore> WriteCoordinator<S> {
  pub fn new(
    store: Arc<S>,
    cache: Arc<ResolutionCache>,
    max_attempts: u32,
  ) -> Self {
    Self {
      store,
      cache,
      locks: DashMap::new(),
      max_attempts: max_attempts.max(1),
    }
  }

  /// Validate and append a single value.
  pub async fn write(
    &self,
    def: &ConfigKeyDefinition,
    scope: Scope,
    raw: Value,
    effective_from: DateTime<Utc>,
    now: DateTime<Utc>,
    created_by: &str,
  ) -> Result<ConfigValueRecord> {
    def.check_scope(&scope)?;
    let value = def.coerce(raw)?;
    let record = NewRecord {
      config_key: def.key.clone(),
      declared_type: def.declared_type,
      scope,
      value,
      effective_from,
      created_at: now,
      created_by: created_by.to_owned(),
    };
    self
      .commit(vec![record])
      .await?
      .pop()
      .ok_or_else(|| Error::UnknownKey(def.key.clone()))
  }

  /// Append already validated records as one batch and invalidate every
  /// touched key.
  pub async fn commit(
    &self,
    records: Vec<NewRecord>,
  ) -> Result<Vec<ConfigValueRecord>> {
    self.apply(Vec::new(), records).await
  }

  /// Define `definitions` and append `records` in one store transaction.
  pub async fn apply(
    &self,
    definitions: Vec<ConfigKeyDefinition>,
    records: Vec<NewRecord>,
  ) -> Result<Vec<ConfigValueRecord>> {
    if definitions.is_empty() && records.is_empty() {
      return Ok(Vec::new());
    }
    let tuples: BTreeSet<Tuple> = records
      .iter()
      .map(|r| (r.config_key.clone(), r.scope.clone()))
      .collect();
    let keys: BTreeSet<&str> =
      records.iter().map(|r| r.config_key.as_str()).collect();

    let _locks = self.lock(tuples).await;

    let mut attempt = 0;
    let appended = loop {
      attempt += 1;
      let outcome = self
        .store
        .define_and_append(definitions.clone(), records.clone())
        .await
        .map_err(Error::store)?;
      match outcome {
        AppendOutcome::Appended(appended) => break appended,
        AppendOutcome::UnknownKey(key) => return Err(Error::UnknownKey(key)),
        AppendOutcome::DuplicateKey(key) => return Err(Error::DuplicateKey(key)),
        AppendOutcome::TypeChanged(key) => {
          return Err(Error::DefinitionChanged(key));
        }
        AppendOutcome::Conflict { config_key, scope }
          if attempt < self.max_attempts =>
        {
          tracing::warn!(
            key = %config_key,
            %scope,
            attempt,
            "version conflict, retrying"
          );
          tokio::task::yield_now().await;
        }
        AppendOutcome::Conflict { config_key, scope } => {
          return Err(Error::ConcurrencyConflict {
            key: config_key,
            scope,
          });
        }
      }
    };

    for key in keys {
      self.cache.invalidate(key);
    }
    for def in &definitions {
      tracing::info!(key = %def.key, declared_type = %def.declared_type, "key defined");
    }
    for record in &appended {
      tracing::info!(
        key = %record.config_key,
        scope = %record.scope,
        version = record.version,
        by = %record.created_by,
        "value written"
      );
    }
    Ok(appended)
  }

  /// Deactivate a record under its tuple's lock.
  pub async fn deactivate(
    &self,
    record_id: Uuid,
    at: DateTime<Utc>,
    actor: &str,
  ) -> Result<ConfigValueRecord> {
    let existing = self
      .store
      .get_record(record_id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::RecordNotFound(record_id))?;
    let tuple = (existing.config_key.clone(), existing.scope.clone());

    let _locks = self.lock(BTreeSet::from([tuple])).await;

    let record = self
      .store
      .deactivate_record(record_id, at, actor.to_owned())
      .await
      .map_err(Error::store)?
      .ok_or(Error::RecordNotFound(record_id))?;

    self.cache.invalidate(&record.config_key);
    tracing::info!(
      key = %record.config_key,
      scope = %record.scope,
      version = record.version,
      by = actor,
      "value deactivated"
    );
    Ok(record)
  }

  /// Number of tuples with a live lock entry.
  pub fn lock_table_len(&self) -> usize { self.locks.len() }

  async fn lock(&self, tuples: BTreeSet<Tuple>) -> TupleLocks<'_> {
    let mut locks = TupleLocks {
      table: &self.locks,
      held:  Vec::with_capacity(tuples.len()),
    };
    for tuple in tuples {
      let lock = self.locks.entry(tuple.clone()).or_default().clone();
      let guard = lock.lock_owned().await;
      locks.held.push((tuple, guard));
    }
    locks
  }
}
