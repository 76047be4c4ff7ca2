//! Export and import of definitions plus current values.
//!
//! An [`ExportDocument`] is self-describing: it carries a format version and
//! a SHA-256 checksum of its entries, so an import can reject documents that
//! were truncated or edited by hand.

use std::{collections::HashSet, pin::pin};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use scopecfg_core::{
  Error, ImportProblem, Result,
  key::{ConfigKeyDefinition, DeclaredType, KeyFilter, NewKeyDefinition},
  record::NewRecord,
  scope::Scope,
  store::ConfigStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::registry::KeyRegistry;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFilter {
  #[serde(default)]
  pub category: Option<String>,
  /// Export only this tuple of each key.
  #[serde(default)]
  pub scope:    Option<Scope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
  pub format_version: u32,
  pub exported_at:    DateTime<Utc>,
  pub entries:        Vec<ExportEntry>,
  /// Lowercase hex SHA-256 of the canonical JSON of `entries`.
  pub checksum:       String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEntry {
  pub definition: NewKeyDefinition,
  pub values:     Vec<ExportedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedValue {
  pub scope:          Scope,
  pub value:          Value,
  /// Source version, informational only.
  pub version:        u64,
  pub effective_from: DateTime<Utc>,
}

/// What to do with keys the registry does not know yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
  /// Every key must already be defined.
  #[default]
  RequireKeys,
  /// Define missing keys from the document's metadata.
  DefineMissing,
}

impl ExportDocument {
  pub fn new(entries: Vec<ExportEntry>, exported_at: DateTime<Utc>) -> Result<Self> {
    let checksum = checksum(&entries)?;
    Ok(Self {
      format_version: FORMAT_VERSION,
      exported_at,
      entries,
      checksum,
    })
  }

  pub fn verify_checksum(&self) -> Result<bool> {
    Ok(checksum(&self.entries)? == self.checksum)
  }
}

/// Hex SHA-256 over `entries` serialised with sorted object keys.
pub fn checksum(entries: &[ExportEntry]) -> Result<String> {
  // Round-trip through `Value` so object keys come out sorted.
  let canonical = serde_json::to_vec(&serde_json::to_value(entries)?)?;
  Ok(hex::encode(Sha256::digest(&canonical)))
}

fn exported_key(def: &ConfigKeyDefinition) -> NewKeyDefinition {
  NewKeyDefinition {
    key:            def.key.clone(),
    description:    def.description.clone(),
    declared_type:  def.declared_type,
    category:       def.category.clone(),
    allowed_scopes: def.allowed_scopes.clone(),
    default_value:  def.default_value.clone(),
  }
}

pub(crate) async fn export<S: ConfigStore>(
  registry: &KeyRegistry<S>,
  store: &S,
  filter: &ExportFilter,
  now: DateTime<Utc>,
) -> Result<ExportDocument> {
  let key_filter = KeyFilter {
    category:        filter.category.clone(),
    scope_dimension: filter.scope.as_ref().and_then(Scope::dimension),
  };

  let mut entries = Vec::new();
  let mut keys = pin!(registry.list(key_filter));
  while let Some(def) = keys.try_next().await? {
    let mut scopes = match &filter.scope {
      Some(scope) => vec![scope.clone()],
      None => store.scopes_for_key(&def.key).await.map_err(Error::store)?,
    };
    // Records left on a dimension the key no longer allows never resolve,
    // and the definition being exported would reject them on import.
    scopes.retain(|scope| def.allows(scope));

    let mut values = Vec::with_capacity(scopes.len());
    for scope in &scopes {
      let current = store
        .current_candidate(&def.key, scope, now)
        .await
        .map_err(Error::store)?;
      if let Some(record) = current {
        values.push(ExportedValue {
          scope:          record.scope,
          value:          record.value,
          version:        record.version,
          effective_from: record.effective_from,
        });
      }
    }

    entries.push(ExportEntry {
      definition: exported_key(&def),
      values,
    });
  }

  ExportDocument::new(entries, now)
}

/// Validated import work: keys to define and records to append, applied
/// together.
pub(crate) struct ImportPlan {
  pub define:  Vec<ConfigKeyDefinition>,
  pub records: Vec<NewRecord>,
}

/// Check the whole document before anything is applied. All problems are
/// collected into one [`Error::ImportValidation`].
pub(crate) async fn plan_import<S: ConfigStore>(
  registry: &KeyRegistry<S>,
  doc: ExportDocument,
  mode: ImportMode,
  now: DateTime<Utc>,
  created_by: &str,
) -> Result<ImportPlan> {
  let mut problems = Vec::new();
  let doc_problem = |reason: String| ImportProblem {
    key: None,
    scope: None,
    reason,
  };

  if doc.format_version != FORMAT_VERSION {
    problems.push(doc_problem(format!(
      "unsupported format version {} (expected {FORMAT_VERSION})",
      doc.format_version
    )));
  }
  if !doc.verify_checksum()? {
    problems.push(doc_problem("checksum mismatch".to_owned()));
  }

  let mut plan = ImportPlan {
    define:  Vec::new(),
    records: Vec::new(),
  };
  let mut seen = HashSet::new();

  for entry in doc.entries {
    let key = entry.definition.key.clone();
    let key_problem = |scope: Option<Scope>, reason: String| ImportProblem {
      key: Some(key.clone()),
      scope,
      reason,
    };

    if !seen.insert(key.clone()) {
      problems.push(key_problem(None, "key appears more than once".to_owned()));
      continue;
    }

    let def = match registry.get(&key).await {
      Ok(def) => def,
      Err(Error::UnknownKey(_)) if mode == ImportMode::DefineMissing => {
        match entry.definition.clone().into_definition(now) {
          Ok(def) => {
            plan.define.push(def.clone());
            def
          }
          Err(e) => {
            problems.push(key_problem(None, e.to_string()));
            continue;
          }
        }
      }
      Err(Error::UnknownKey(_)) => {
        problems.push(key_problem(None, "unknown config key".to_owned()));
        continue;
      }
      Err(e) => return Err(e),
    };

    if let Some(reason) =
      type_mismatch(def.declared_type, entry.definition.declared_type)
    {
      problems.push(key_problem(None, reason));
      continue;
    }

    for exported in entry.values {
      let checked = def
        .check_scope(&exported.scope)
        .and_then(|()| def.coerce(exported.value));
      match checked {
        Ok(value) => plan.records.push(NewRecord {
          config_key: key.clone(),
          declared_type: def.declared_type,
          scope: exported.scope,
          value,
          effective_from: now,
          created_at: now,
          created_by: created_by.to_owned(),
        }),
        Err(e) => {
          problems.push(key_problem(Some(exported.scope), e.to_string()))
        }
      }
    }
  }

  if problems.is_empty() {
    Ok(plan)
  } else {
    Err(Error::ImportValidation(problems))
  }
}

fn type_mismatch(registry: DeclaredType, document: DeclaredType) -> Option<String> {
  (registry != document).then(|| {
    format!("declared type {document} does not match registered type {registry}")
  })
}
