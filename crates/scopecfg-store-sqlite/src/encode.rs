//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microsecond
//! precision, `Z` suffix) so that SQL string comparison orders them
//! chronologically. Values and scope sets are compact JSON. UUIDs are
//! hyphenated lowercase strings.

use std::{collections::BTreeSet, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use scopecfg_core::{
  key::{ConfigKeyDefinition, DeclaredType},
  record::ConfigValueRecord,
  scope::{Scope, ScopeDimension},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Scope ───────────────────────────────────────────────────────────────────

/// Split a scope into its `(scope_dimension, scope_value)` columns.
pub fn encode_scope(scope: &Scope) -> (String, String) {
  let dimension = scope
    .dimension()
    .map_or_else(|| "global".to_owned(), |d| d.to_string());
  let value = scope.value().unwrap_or_default().to_owned();
  (dimension, value)
}

pub fn decode_scope(dimension: &str, value: String) -> Result<Scope> {
  if dimension == "global" {
    return Ok(Scope::Global);
  }
  let dim = ScopeDimension::from_str(dimension).map_err(|_| Error::Decode {
    column: "scope_dimension",
    value:  dimension.to_owned(),
  })?;
  Scope::on(dim, value.clone()).map_err(|_| Error::Decode {
    column: "scope_value",
    value,
  })
}

pub fn encode_dimensions(dims: &BTreeSet<ScopeDimension>) -> Result<String> {
  Ok(serde_json::to_string(dims)?)
}

pub fn decode_dimensions(s: &str) -> Result<BTreeSet<ScopeDimension>> {
  Ok(serde_json::from_str(s)?)
}

// ─── DeclaredType ────────────────────────────────────────────────────────────

pub fn encode_type(t: DeclaredType) -> &'static str {
  match t {
    DeclaredType::String => "string",
    DeclaredType::Number => "number",
    DeclaredType::Boolean => "boolean",
    DeclaredType::Json => "json",
    DeclaredType::Array => "array",
  }
}

pub fn decode_type(s: &str) -> Result<DeclaredType> {
  DeclaredType::from_str(s).map_err(|_| Error::Decode {
    column: "declared_type",
    value:  s.to_owned(),
  })
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const DEFINITION_COLUMNS: &str = "key, description, declared_type, category, \
   allowed_scopes, default_json, created_at, updated_at";

/// Raw strings read directly from a `config_keys` row.
pub struct RawDefinition {
  pub key:            String,
  pub description:    String,
  pub declared_type:  String,
  pub category:       String,
  pub allowed_scopes: String,
  pub default_json:   Option<String>,
  pub created_at:     String,
  pub updated_at:     String,
}

impl RawDefinition {
  /// Map a row selected with [`DEFINITION_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key:            row.get(0)?,
      description:    row.get(1)?,
      declared_type:  row.get(2)?,
      category:       row.get(3)?,
      allowed_scopes: row.get(4)?,
      default_json:   row.get(5)?,
      created_at:     row.get(6)?,
      updated_at:     row.get(7)?,
    })
  }

  pub fn into_definition(self) -> Result<ConfigKeyDefinition> {
    Ok(ConfigKeyDefinition {
      key:            self.key,
      description:    self.description,
      declared_type:  decode_type(&self.declared_type)?,
      category:       self.category,
      allowed_scopes: decode_dimensions(&self.allowed_scopes)?,
      default_value:  self
        .default_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?,
      created_at:     decode_dt(&self.created_at)?,
      updated_at:     decode_dt(&self.updated_at)?,
    })
  }
}

pub const RECORD_COLUMNS: &str = "record_id, config_key, scope_dimension, \
   scope_value, value_json, version, effective_from, is_active, created_at, \
   created_by, deactivated_at, deactivated_by";

/// Raw strings read directly from a `config_values` row.
pub struct RawRecord {
  pub record_id:       String,
  pub config_key:      String,
  pub scope_dimension: String,
  pub scope_value:     String,
  pub value_json:      String,
  pub version:         i64,
  pub effective_from:  String,
  pub is_active:       bool,
  pub created_at:      String,
  pub created_by:      String,
  pub deactivated_at:  Option<String>,
  pub deactivated_by:  Option<String>,
}

impl RawRecord {
  /// Map a row selected with [`RECORD_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      record_id:       row.get(0)?,
      config_key:      row.get(1)?,
      scope_dimension: row.get(2)?,
      scope_value:     row.get(3)?,
      value_json:      row.get(4)?,
      version:         row.get(5)?,
      effective_from:  row.get(6)?,
      is_active:       row.get(7)?,
      created_at:      row.get(8)?,
      created_by:      row.get(9)?,
      deactivated_at:  row.get(10)?,
      deactivated_by:  row.get(11)?,
    })
  }

  pub fn into_record(self) -> Result<ConfigValueRecord> {
    let version = u64::try_from(self.version).map_err(|_| Error::Decode {
      column: "version",
      value:  self.version.to_string(),
    })?;

    Ok(ConfigValueRecord {
      record_id: decode_uuid(&self.record_id)?,
      config_key: self.config_key,
      scope: decode_scope(&self.scope_dimension, self.scope_value)?,
      value: serde_json::from_str(&self.value_json)?,
      version,
      effective_from: decode_dt(&self.effective_from)?,
      is_active: self.is_active,
      created_at: decode_dt(&self.created_at)?,
      created_by: self.created_by,
      deactivated_at: self.deactivated_at.as_deref().map(decode_dt).transpose()?,
      deactivated_by: self.deactivated_by,
    })
  }
}
