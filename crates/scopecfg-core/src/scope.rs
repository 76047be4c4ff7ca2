//! Scope dimensions, stored scope descriptors, and read-side contexts.
//!
//! A stored value is attached to exactly one [`Scope`]: the global scope or a
//! single dimension value. Reads carry a [`ScopeContext`], which may name any
//! subset of dimensions; the resolver walks it from most to least specific.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result};

// ─── Dimension ───────────────────────────────────────────────────────────────

/// An axis along which a config value can be overridden.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ScopeDimension {
  Persona,
  Agent,
  Workflow,
}

impl ScopeDimension {
  /// Dimensions ordered most specific first.
  pub const PRECEDENCE: [Self; 3] = [Self::Workflow, Self::Agent, Self::Persona];
}

// ─── Scope ───────────────────────────────────────────────────────────────────

/// The scope a stored value applies to. At most one dimension by
/// construction.
#[derive(
  Debug,
  Clone,
  Default,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
)]
#[serde(tag = "dimension", content = "value", rename_all = "lowercase")]
pub enum Scope {
  #[default]
  Global,
  Persona(String),
  Agent(String),
  Workflow(String),
}

impl Scope {
  /// Build a single-dimension scope, rejecting blank values.
  pub fn on(dimension: ScopeDimension, value: impl Into<String>) -> Result<Self> {
    let value = value.into();
    if value.trim().is_empty() {
      return Err(Error::InvalidScope(format!("empty {dimension} value")));
    }
    Ok(match dimension {
      ScopeDimension::Persona => Self::Persona(value),
      ScopeDimension::Agent => Self::Agent(value),
      ScopeDimension::Workflow => Self::Workflow(value),
    })
  }

  pub fn dimension(&self) -> Option<ScopeDimension> {
    match self {
      Self::Global => None,
      Self::Persona(_) => Some(ScopeDimension::Persona),
      Self::Agent(_) => Some(ScopeDimension::Agent),
      Self::Workflow(_) => Some(ScopeDimension::Workflow),
    }
  }

  pub fn value(&self) -> Option<&str> {
    match self {
      Self::Global => None,
      Self::Persona(v) | Self::Agent(v) | Self::Workflow(v) => Some(v),
    }
  }

  pub fn is_global(&self) -> bool { matches!(self, Self::Global) }

  /// Reject scopes built directly with a blank dimension value.
  pub fn validate(&self) -> Result<()> {
    match (self.dimension(), self.value()) {
      (Some(dim), Some(v)) if v.trim().is_empty() => {
        Err(Error::InvalidScope(format!("empty {dim} value")))
      }
      _ => Ok(()),
    }
  }
}

impl fmt::Display for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (self.dimension(), self.value()) {
      (Some(dim), Some(v)) => write!(f, "{dim}={v}"),
      _ => f.write_str("global"),
    }
  }
}

/// Parses `global` or `<dimension>=<value>`, e.g. `persona=rachel`.
impl FromStr for Scope {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("global") {
      return Ok(Self::Global);
    }
    let (dim, value) = s.split_once('=').ok_or_else(|| {
      Error::InvalidScope(format!("expected `global` or `dimension=value`, got {s:?}"))
    })?;
    let dimension = ScopeDimension::from_str(dim.trim())
      .map_err(|_| Error::InvalidScope(format!("unknown dimension {dim:?}")))?;
    Self::on(dimension, value.trim())
  }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// The scope information carried by a read request.
///
/// Also serves as the cache fingerprint together with the key, so two
/// contexts that differ only by blank fields should be [`normalized`] first.
///
/// [`normalized`]: ScopeContext::normalized
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeContext {
  #[serde(default)]
  pub persona:     Option<String>,
  #[serde(default)]
  pub agent_id:    Option<String>,
  #[serde(default)]
  pub workflow_id: Option<String>,
}

impl ScopeContext {
  pub fn global() -> Self { Self::default() }

  pub fn persona(persona: impl Into<String>) -> Self {
    Self::global().with_persona(persona)
  }

  pub fn agent(agent_id: impl Into<String>) -> Self {
    Self::global().with_agent(agent_id)
  }

  pub fn workflow(workflow_id: impl Into<String>) -> Self {
    Self::global().with_workflow(workflow_id)
  }

  pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
    self.persona = Some(persona.into());
    self
  }

  pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
    self.agent_id = Some(agent_id.into());
    self
  }

  pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
    self.workflow_id = Some(workflow_id.into());
    self
  }

  /// Drop blank fields so they behave as absent.
  pub fn normalized(self) -> Self {
    fn keep(v: Option<String>) -> Option<String> {
      v.filter(|s| !s.trim().is_empty())
    }
    Self {
      persona:     keep(self.persona),
      agent_id:    keep(self.agent_id),
      workflow_id: keep(self.workflow_id),
    }
  }

  pub fn get(&self, dimension: ScopeDimension) -> Option<&str> {
    let v = match dimension {
      ScopeDimension::Persona => &self.persona,
      ScopeDimension::Agent => &self.agent_id,
      ScopeDimension::Workflow => &self.workflow_id,
    };
    v.as_deref().filter(|s| !s.trim().is_empty())
  }

  /// The scopes to consult, most specific first, always ending in
  /// [`Scope::Global`].
  pub fn precedence(&self) -> Vec<Scope> {
    let mut chain: Vec<Scope> = ScopeDimension::PRECEDENCE
      .into_iter()
      .filter_map(|dim| {
        self.get(dim).and_then(|v| Scope::on(dim, v).ok())
      })
      .collect();
    chain.push(Scope::Global);
    chain
  }

  /// Interpret this context as a write target.
  pub fn write_scope(&self) -> Result<Scope> {
    let named: Vec<Scope> = ScopeDimension::PRECEDENCE
      .into_iter()
      .filter_map(|dim| self.get(dim).map(|v| (dim, v)))
      .map(|(dim, v)| Scope::on(dim, v))
      .collect::<Result<_>>()?;
    match named.len() {
      0 => Ok(Scope::Global),
      1 => Ok(named.into_iter().next().unwrap_or(Scope::Global)),
      n => Err(Error::AmbiguousScope(n)),
    }
  }
}

impl From<&Scope> for ScopeContext {
  fn from(scope: &Scope) -> Self {
    match scope {
      Scope::Global => Self::global(),
      Scope::Persona(v) => Self::persona(v.clone()),
      Scope::Agent(v) => Self::agent(v.clone()),
      Scope::Workflow(v) => Self::workflow(v.clone()),
    }
  }
}
