//! The `ConfigStore` trait and its outcome types.
//!
//! The trait is implemented by storage backends (e.g. `scopecfg-store-sqlite`)
//! and covers both durable halves of the engine: the key registry and the
//! scoped value store. Type and scope validation happen above this layer; a
//! backend only guarantees atomicity and version assignment.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  key::{ConfigKeyDefinition, KeyFilter},
  record::{ConfigValueRecord, NewRecord},
  scope::Scope,
};

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Result of [`ConfigStore::insert_definition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
  Inserted,
  AlreadyExists,
}

/// Result of [`ConfigStore::update_definition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
  Updated,
  NotFound,
  /// The declared type would change but value records already exist.
  TypeLocked,
}

/// Result of [`ConfigStore::delete_definition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
  Deleted,
  NotFound,
  /// Number of records (active or not) still referencing the key.
  InUse(u64),
}

/// Result of [`ConfigStore::append_records`]. Nothing is persisted unless
/// the outcome is `Appended`.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
  /// Persisted records, in input order.
  Appended(Vec<ConfigValueRecord>),
  /// A referenced key has no definition.
  UnknownKey(String),
  /// A definition submitted alongside the records already exists.
  DuplicateKey(String),
  /// The key's registered type differs from the one the value was checked
  /// against.
  TypeChanged(String),
  /// Version assignment raced with another writer on this tuple.
  Conflict { config_key: String, scope: Scope },
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a config store backend.
///
/// Value records are append-only apart from deactivation. All methods return
/// `Send` futures so the trait can be used from multi-threaded runtimes.
pub trait ConfigStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Key registry ──────────────────────────────────────────────────────

  fn insert_definition(
    &self,
    def: ConfigKeyDefinition,
  ) -> impl Future<Output = Result<InsertOutcome, Self::Error>> + Send + '_;

  fn get_definition<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Future<Output = Result<Option<ConfigKeyDefinition>, Self::Error>>
  + Send
  + 'a;

  /// One page of definitions matching `filter`, ordered by key, starting
  /// strictly after `after`.
  fn list_definitions<'a>(
    &'a self,
    filter: &'a KeyFilter,
    after: Option<&'a str>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<ConfigKeyDefinition>, Self::Error>>
  + Send
  + 'a;

  /// Replace a stored definition. Must refuse a declared-type change while
  /// records reference the key, atomically with the check.
  fn update_definition(
    &self,
    def: ConfigKeyDefinition,
  ) -> impl Future<Output = Result<UpdateOutcome, Self::Error>> + Send + '_;

  /// Delete a definition unless any record references it.
  fn delete_definition<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Future<Output = Result<DeleteOutcome, Self::Error>> + Send + 'a;

  // ── Value records ─────────────────────────────────────────────────────

  /// Persist `records` in one transaction, each receiving
  /// `max(version) + 1` for its tuple. Several records on the same tuple get
  /// consecutive versions in input order. All or nothing.
  fn append_records(
    &self,
    records: Vec<NewRecord>,
  ) -> impl Future<Output = Result<AppendOutcome, Self::Error>> + Send + '_ {
    self.define_and_append(Vec::new(), records)
  }

  /// Insert `definitions`, then append `records`, in one transaction. Any
  /// outcome other than `Appended` leaves both untouched.
  fn define_and_append(
    &self,
    definitions: Vec<ConfigKeyDefinition>,
    records: Vec<NewRecord>,
  ) -> impl Future<Output = Result<AppendOutcome, Self::Error>> + Send + '_;

  fn get_record(
    &self,
    record_id: Uuid,
  ) -> impl Future<Output = Result<Option<ConfigValueRecord>, Self::Error>>
  + Send
  + '_;

  /// Mark a record inactive. Already-inactive records are returned
  /// unchanged; `None` if the id is unknown.
  fn deactivate_record(
    &self,
    record_id: Uuid,
    at: DateTime<Utc>,
    by: String,
  ) -> impl Future<Output = Result<Option<ConfigValueRecord>, Self::Error>>
  + Send
  + '_;

  /// Every version of a tuple, newest first.
  fn history<'a>(
    &'a self,
    config_key: &'a str,
    scope: &'a Scope,
  ) -> impl Future<Output = Result<Vec<ConfigValueRecord>, Self::Error>>
  + Send
  + 'a;

  /// The highest-version active record of a tuple with
  /// `effective_from <= as_of`.
  fn current_candidate<'a>(
    &'a self,
    config_key: &'a str,
    scope: &'a Scope,
    as_of: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<ConfigValueRecord>, Self::Error>>
  + Send
  + 'a;

  /// The earliest `effective_from` strictly after `after` among active
  /// records of the given tuples.
  fn next_effective_after<'a>(
    &'a self,
    config_key: &'a str,
    scopes: &'a [Scope],
    after: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>>
  + Send
  + 'a;

  /// Distinct scopes holding at least one record for `config_key`, sorted.
  fn scopes_for_key<'a>(
    &'a self,
    config_key: &'a str,
  ) -> impl Future<Output = Result<Vec<Scope>, Self::Error>> + Send + 'a;
}
