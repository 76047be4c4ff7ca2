//! Error types for `scopecfg-core`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{key::DeclaredType, scope::Scope};

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown config key: {0}")]
  UnknownKey(String),

  #[error("config key already defined: {0}")]
  DuplicateKey(String),

  #[error("unrecognised declared type: {0:?}")]
  InvalidType(String),

  #[error("invalid config key name {key:?}: {reason}")]
  InvalidKeyName { key: String, reason: String },

  #[error("invalid scope: {0}")]
  InvalidScope(String),

  /// A write target named more than one scope dimension.
  #[error("a write scope may name at most one dimension, got {0}")]
  AmbiguousScope(usize),

  #[error("value for {key} is not a valid {expected}: {reason}")]
  TypeValidation {
    key:      String,
    expected: DeclaredType,
    reason:   String,
  },

  #[error("{key} may not be overridden at scope {scope}")]
  ScopeNotAllowed { key: String, scope: Scope },

  /// Version assignment lost a race; safe to retry.
  #[error("concurrent write conflict on {key} at scope {scope}")]
  ConcurrencyConflict { key: String, scope: Scope },

  /// The key was redefined after the value was checked; re-read it and try
  /// again.
  #[error("definition of {0} changed during the write")]
  DefinitionChanged(String),

  #[error("config key {key} is referenced by {records} value record(s)")]
  KeyInUse { key: String, records: u64 },

  #[error("declared type of {0} cannot change once values exist")]
  TypeLocked(String),

  #[error("value record not found: {0}")]
  RecordNotFound(Uuid),

  #[error("bulk write rejected: {} invalid item(s)", .0.len())]
  BulkValidation(Vec<ItemProblem>),

  #[error("import rejected: {} problem(s)", .0.len())]
  ImportValidation(Vec<ImportProblem>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Wrap a backend error.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }

  /// Whether repeating the same call may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::ConcurrencyConflict { .. } | Self::DefinitionChanged(_)
    )
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ─── Aggregate problems ──────────────────────────────────────────────────────

/// One rejected item of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProblem {
  /// Position of the item in the submitted batch.
  pub index:  usize,
  pub key:    String,
  pub scope:  Scope,
  pub reason: String,
}

/// One problem found while validating an import document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProblem {
  /// `None` for document-level problems (format version, checksum).
  pub key:    Option<String>,
  pub scope:  Option<Scope>,
  pub reason: String,
}
