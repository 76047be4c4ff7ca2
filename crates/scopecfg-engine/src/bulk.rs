//! Bulk writes: validate everything, then persist everything or nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use scopecfg_core::{
  Error, ItemProblem, Result,
  key::ConfigKeyDefinition,
  record::NewRecord,
  scope::Scope,
  store::ConfigStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::KeyRegistry;

/// One value of a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
  pub config_key:     String,
  #[serde(default)]
  pub scope:          Scope,
  pub value:          Value,
  /// Defaults to the time of the write.
  #[serde(default)]
  pub effective_from: Option<DateTime<Utc>>,
}

impl BulkItem {
  pub fn new(
    config_key: impl Into<String>,
    scope: Scope,
    value: Value,
  ) -> Self {
    Self {
      config_key: config_key.into(),
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

/// Turn `items` into records, or fail with [`Error::BulkValidation`] listing
/// every item that would be rejected.
pub(crate) async fn prepare<S: ConfigStore>(
  registry: &KeyRegistry<S>,
  items: Vec<BulkItem>,
  now: DateTime<Utc>,
  created_by: &str,
) -> Result<Vec<NewRecord>> {
  let mut defs: HashMap<String, Option<ConfigKeyDefinition>> = HashMap::new();
  let mut records = Vec::with_capacity(items.len());
  let mut problems = Vec::new();

  for (index, item) in items.into_iter().enumerate() {
    if !defs.contains_key(&item.config_key) {
      let def = match registry.get(&item.config_key).await {
        Ok(def) => Some(def),
        Err(Error::UnknownKey(_)) => None,
        Err(e) => return Err(e),
      };
      defs.insert(item.config_key.clone(), def);
    }
    let Some(Some(def)) = defs.get(&item.config_key) else {
      problems.push(ItemProblem {
        index,
        reason: format!("unknown config key {:?}", item.config_key),
        key: item.config_key,
        scope: item.scope,
      });
      continue;
    };

    let checked = def
      .check_scope(&item.scope)
      .and_then(|()| def.coerce(item.value));
    match checked {
      Ok(value) => records.push(NewRecord {
        config_key: item.config_key,
        declared_type: def.declared_type,
        scope: item.scope,
        value,
        effective_from: item.effective_from.unwrap_or(now),
        created_at: now,
        created_by: created_by.to_owned(),
      }),
      Err(e) => problems.push(ItemProblem {
        index,
        key: item.config_key,
        scope: item.scope,
        reason: e.to_string(),
      }),
    }
  }

  if problems.is_empty() {
    Ok(records)
  } else {
    Err(Error::BulkValidation(problems))
  }
}
