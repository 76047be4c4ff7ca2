//! Precedence resolution.
//!
//! Walks a request context from the most specific scope to the global scope
//! and returns the first current record, then the key's default, then
//! [`Resolution::Empty`]. Only one record lookup per consulted scope.

use chrono::{DateTime, Utc};

use crate::{
  Error, Result,
  key::ConfigKeyDefinition,
  record::Resolution,
  scope::{Scope, ScopeContext},
  store::ConfigStore,
};

/// A resolution plus the instant it may stop being correct on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
  pub resolution:  Resolution,
  /// Earliest scheduled activation that could change the result: any future
  /// record at the winning scope or a more specific one.
  pub next_change: Option<DateTime<Utc>>,
}

/// Resolve `def` for `ctx` as of `as_of`.
///
/// Scopes on dimensions the key does not allow are skipped.
pub async fn resolve<S>(
  store: &S,
  def: &ConfigKeyDefinition,
  ctx: &ScopeContext,
  as_of: DateTime<Utc>,
) -> Result<Resolved>
where
  S: ConfigStore,
{
  let chain: Vec<Scope> = ctx
    .precedence()
    .into_iter()
    .filter(|scope| def.allows(scope))
    .collect();

  let mut winner = None;
  for (idx, scope) in chain.iter().enumerate() {
    let candidate = store
      .current_candidate(&def.key, scope, as_of)
      .await
      .map_err(Error::store)?;
    if let Some(record) = candidate {
      winner = Some((idx, record));
      break;
    }
  }

  let watched = match &winner {
    Some((idx, _)) => &chain[..=*idx],
    None => &chain[..],
  };
  let next_change = store
    .next_effective_after(&def.key, watched, as_of)
    .await
    .map_err(Error::store)?;

  let resolution = match (winner, &def.default_value) {
    (Some((_, record)), _) => Resolution::from_record(record),
    (None, Some(value)) => Resolution::Default { value: value.clone() },
    (None, None) => Resolution::Empty,
  };

  Ok(Resolved { resolution, next_change })
}

/// Look up `key` and resolve it, failing with [`Error::UnknownKey`] if the
/// key is not registered.
pub async fn resolve_key<S>(
  store: &S,
  key: &str,
  ctx: &ScopeContext,
  as_of: DateTime<Utc>,
) -> Result<Resolved>
where
  S: ConfigStore,
{
  let def = store
    .get_definition(key)
    .await
    .map_err(Error::store)?
    .ok_or_else(|| Error::UnknownKey(key.to_owned()))?;
  resolve(store, &def, ctx, as_of).await
}
