//! Config key definitions: the rows of the key registry.
//!
//! A definition fixes a key's declared type, the scope dimensions it may be
//! overridden on, and an optional default. Definitions change far less often
//! than values and are safe to cache.

use std::{collections::BTreeSet, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::{
  Error, Result,
  scope::{Scope, ScopeDimension},
};

// ─── Declared type ───────────────────────────────────────────────────────────

/// The closed set of value types a key may declare.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeclaredType {
  String,
  Number,
  Boolean,
  Json,
  Array,
}

impl DeclaredType {
  /// Parse a type name, failing with [`Error::InvalidType`].
  pub fn parse(name: &str) -> Result<Self> {
    Self::from_str(name.trim()).map_err(|_| Error::InvalidType(name.to_owned()))
  }
}

// ─── Key names ───────────────────────────────────────────────────────────────

/// Check that `key` is dot-notation made of non-empty `[A-Za-z0-9_-]`
/// segments.
pub fn validate_key_name(key: &str) -> Result<()> {
  let invalid = |reason: &str| Error::InvalidKeyName {
    key:    key.to_owned(),
    reason: reason.to_owned(),
  };

  if key.is_empty() {
    return Err(invalid("empty key"));
  }
  for segment in key.split('.') {
    if segment.is_empty() {
      return Err(invalid("empty segment"));
    }
    if let Some(c) = segment
      .chars()
      .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
      return Err(invalid(&format!("unexpected character {c:?}")));
    }
  }
  Ok(())
}

// ─── Definition ──────────────────────────────────────────────────────────────

/// A registered config key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigKeyDefinition {
  pub key:            String,
  pub description:    String,
  pub declared_type:  DeclaredType,
  pub category:       String,
  /// Empty means the key can only hold a global value.
  pub allowed_scopes: BTreeSet<ScopeDimension>,
  pub default_value:  Option<Value>,
  pub created_at:     DateTime<Utc>,
  pub updated_at:     DateTime<Utc>,
}

impl ConfigKeyDefinition {
  /// Whether a value may be stored at `scope` for this key.
  pub fn allows(&self, scope: &Scope) -> bool {
    scope
      .dimension()
      .is_none_or(|dim| self.allowed_scopes.contains(&dim))
  }

  pub fn check_scope(&self, scope: &Scope) -> Result<()> {
    scope.validate()?;
    if self.allows(scope) {
      Ok(())
    } else {
      Err(Error::ScopeNotAllowed {
        key:   self.key.clone(),
        scope: scope.clone(),
      })
    }
  }

  /// Validate `raw` against the declared type, returning the stored form.
  pub fn coerce(&self, raw: Value) -> Result<Value> {
    self
      .declared_type
      .coerce(raw)
      .map_err(|reason| Error::TypeValidation {
        key: self.key.clone(),
        expected: self.declared_type,
        reason,
      })
  }
}

/// Input to the registry's `define` operation. Timestamps are assigned by the
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKeyDefinition {
  pub key:            String,
  #[serde(default)]
  pub description:    String,
  pub declared_type:  DeclaredType,
  #[serde(default)]
  pub category:       String,
  #[serde(default)]
  pub allowed_scopes: BTreeSet<ScopeDimension>,
  #[serde(default)]
  pub default_value:  Option<Value>,
}

impl NewKeyDefinition {
  /// A global-only key with no default.
  pub fn new(key: impl Into<String>, declared_type: DeclaredType) -> Self {
    Self {
      key: key.into(),
      description: String::new(),
      declared_type,
      category: String::new(),
      allowed_scopes: BTreeSet::new(),
      default_value: None,
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn category(mut self, category: impl Into<String>) -> Self {
    self.category = category.into();
    self
  }

  pub fn scopes(
    mut self,
    dimensions: impl IntoIterator<Item = ScopeDimension>,
  ) -> Self {
    self.allowed_scopes = dimensions.into_iter().collect();
    self
  }

  pub fn default_value(mut self, value: Value) -> Self {
    self.default_value = Some(value);
    self
  }

  /// Validate the name and default, producing the definition to persist.
  pub fn into_definition(self, now: DateTime<Utc>) -> Result<ConfigKeyDefinition> {
    validate_key_name(&self.key)?;
    let mut def = ConfigKeyDefinition {
      key:            self.key,
      description:    self.description,
      declared_type:  self.declared_type,
      category:       self.category,
      allowed_scopes: self.allowed_scopes,
      default_value:  None,
      created_at:     now,
      updated_at:     now,
    };
    def.default_value = self.default_value.map(|v| def.coerce(v)).transpose()?;
    Ok(def)
  }
}

// ─── Patch ───────────────────────────────────────────────────────────────────

/// Changes to an existing definition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyPatch {
  #[serde(default)]
  pub description:    Option<String>,
  #[serde(default)]
  pub category:       Option<String>,
  #[serde(default)]
  pub declared_type:  Option<DeclaredType>,
  #[serde(default)]
  pub allowed_scopes: Option<BTreeSet<ScopeDimension>>,
  /// `Some(None)` clears the default.
  #[serde(default)]
  pub default_value:  Option<Option<Value>>,
}

impl KeyPatch {
  pub fn is_empty(&self) -> bool { *self == Self::default() }

  /// Whether applying this patch would change the declared type of `def`.
  pub fn changes_type(&self, def: &ConfigKeyDefinition) -> bool {
    self.declared_type.is_some_and(|t| t != def.declared_type)
  }

  /// Apply the patch, re-validating the default against the resulting type.
  pub fn apply(
    self,
    mut def: ConfigKeyDefinition,
    now: DateTime<Utc>,
  ) -> Result<ConfigKeyDefinition> {
    if let Some(description) = self.description {
      def.description = description;
    }
    if let Some(category) = self.category {
      def.category = category;
    }
    if let Some(declared_type) = self.declared_type {
      def.declared_type = declared_type;
    }
    if let Some(scopes) = self.allowed_scopes {
      def.allowed_scopes = scopes;
    }
    if let Some(default_value) = self.default_value {
      def.default_value = default_value;
    }
    def.default_value = def
      .default_value
      .take()
      .map(|v| def.coerce(v))
      .transpose()?;
    def.updated_at = now;
    Ok(def)
  }
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Parameters for listing definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFilter {
  pub category:        Option<String>,
  /// Only keys that may be overridden on this dimension.
  pub scope_dimension: Option<ScopeDimension>,
}

impl KeyFilter {
  pub fn matches(&self, def: &ConfigKeyDefinition) -> bool {
    self.category.as_ref().is_none_or(|c| *c == def.category)
      && self
        .scope_dimension
        .is_none_or(|dim| def.allowed_scopes.contains(&dim))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn key_names() {
    assert!(validate_key_name("ui.theme.primaryColor").is_ok());
    assert!(validate_key_name("agents.visibility_rules.max-count").is_ok());
    assert!(validate_key_name("").is_err());
    assert!(validate_key_name("ui..theme").is_err());
    assert!(validate_key_name("ui.theme.").is_err());
    assert!(validate_key_name("ui theme").is_err());
  }

  #[test]
  fn unknown_type_name() {
    assert_eq!(DeclaredType::parse("Number").unwrap(), DeclaredType::Number);
    assert!(matches!(
      DeclaredType::parse("float"),
      Err(Error::InvalidType(name)) if name == "float"
    ));
  }

  #[test]
  fn default_is_validated_on_define() {
    let now = Utc::now();
    let err = NewKeyDefinition::new("limits.max", DeclaredType::Number)
      .default_value(json!("lots"))
      .into_definition(now)
      .unwrap_err();
    assert!(matches!(err, Error::TypeValidation { .. }));

    let def = NewKeyDefinition::new("limits.max", DeclaredType::Number)
      .default_value(json!("12"))
      .into_definition(now)
      .unwrap();
    assert_eq!(def.default_value, Some(json!(12)));
  }

  #[test]
  fn scope_allowance() {
    let def = NewKeyDefinition::new("ui.theme.primaryColor", DeclaredType::String)
      .scopes([ScopeDimension::Persona])
      .into_definition(Utc::now())
      .unwrap();
    assert!(def.check_scope(&Scope::Global).is_ok());
    assert!(def.check_scope(&Scope::Persona("rachel".into())).is_ok());
    assert!(matches!(
      def.check_scope(&Scope::Agent("a-1".into())),
      Err(Error::ScopeNotAllowed { .. })
    ));
  }

  #[test]
  fn patch_revalidates_default() {
    let def = NewKeyDefinition::new("flags.beta", DeclaredType::Boolean)
      .default_value(json!(true))
      .into_definition(Utc::now())
      .unwrap();
    let patch = KeyPatch {
      declared_type: Some(DeclaredType::Array),
      ..KeyPatch::default()
    };
    assert!(patch.changes_type(&def));
    assert!(patch.apply(def, Utc::now()).is_err());
  }

  #[test]
  fn filter_matches() {
    let def = NewKeyDefinition::new("ui.theme.primaryColor", DeclaredType::String)
      .category("theme")
      .scopes([ScopeDimension::Persona])
      .into_definition(Utc::now())
      .unwrap();
    assert!(KeyFilter::default().matches(&def));
    assert!(KeyFilter {
      category:        Some("theme".into()),
      scope_dimension: Some(ScopeDimension::Persona),
    }
    .matches(&def));
    assert!(!KeyFilter {
      category:        None,
      scope_dimension: Some(ScopeDimension::Workflow),
    }
    .matches(&def));
  }
}
