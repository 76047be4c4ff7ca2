//! Value records and resolution results.
//!
//! Records are append-only. The only mutation a record ever sees is
//! deactivation, which retires it from resolution while keeping it in the
//! history of its `(key, scope)` tuple.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{key::DeclaredType, scope::Scope};

// ─── Record ──────────────────────────────────────────────────────────────────

/// One version of a value for a `(key, scope)` tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigValueRecord {
  pub record_id:      Uuid,
  pub config_key:     String,
  pub scope:          Scope,
  /// Stored in the key's declared type; never raw text for `json`/`array`.
  pub value:          Value,
  /// Gapless from 1 within the tuple.
  pub version:        u64,
  pub effective_from: DateTime<Utc>,
  pub is_active:      bool,
  pub created_at:     DateTime<Utc>,
  pub created_by:     String,
  pub deactivated_at: Option<DateTime<Utc>>,
  pub deactivated_by: Option<String>,
}

impl ConfigValueRecord {
  /// Whether the record can be selected by resolution at `as_of`.
  pub fn is_eligible(&self, as_of: DateTime<Utc>) -> bool {
    self.is_active && self.effective_from <= as_of
  }
}

/// A validated record waiting for its id and version.
///
/// Input to [`crate::store::ConfigStore::append_records`]; the store assigns
/// `record_id` and the next `version` for the tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
  pub config_key:     String,
  /// Type `value` was checked against. The store refuses the record if the
  /// key's registered type no longer matches.
  pub declared_type:  DeclaredType,
  pub scope:          Scope,
  pub value:          Value,
  pub effective_from: DateTime<Utc>,
  pub created_at:     DateTime<Utc>,
  pub created_by:     String,
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// The effective value of a key for a request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Resolution {
  /// A stored record won.
  Override {
    value:     Value,
    record_id: Uuid,
    scope:     Scope,
    version:   u64,
  },
  /// No record applied; the key's default was used.
  Default { value: Value },
  /// Neither a record nor a default exists. Callers apply their own
  /// fallback.
  Empty,
}

impl Resolution {
  pub fn from_record(record: ConfigValueRecord) -> Self {
    Self::Override {
      value:     record.value,
      record_id: record.record_id,
      scope:     record.scope,
      version:   record.version,
    }
  }

  pub fn value(&self) -> Option<&Value> {
    match self {
      Self::Override { value, .. } | Self::Default { value } => Some(value),
      Self::Empty => None,
    }
  }

  pub fn into_value(self) -> Option<Value> {
    match self {
      Self::Override { value, .. } | Self::Default { value } => Some(value),
      Self::Empty => None,
    }
  }

  pub fn is_empty(&self) -> bool { matches!(self, Self::Empty) }
}
