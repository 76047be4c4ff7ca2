//! Subcommands and their dispatch onto [`ConfigService`].

use std::{
  collections::BTreeSet,
  io::Read as _,
  path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use futures::TryStreamExt;
use scopecfg_core::{
  Error,
  key::{DeclaredType, KeyFilter, KeyPatch, NewKeyDefinition},
  scope::{Scope, ScopeContext, ScopeDimension},
  store::ConfigStore,
};
use scopecfg_engine::{
  BulkItem, ConfigService, ExportDocument, ExportFilter, ImportMode, PutValue,
};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum Command {
  /// Register a new config key.
  Define {
    key:         String,
    /// string, number, boolean, json or array.
    #[arg(long = "type")]
    declared_type: DeclaredType,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long, default_value = "general")]
    category:    String,
    /// Dimension that may override the global value; repeatable.
    #[arg(long = "scope")]
    scopes:      Vec<ScopeDimension>,
    /// Default value as JSON text.
    #[arg(long)]
    default:     Option<String>,
  },
  /// List registered keys.
  Keys {
    #[arg(long)]
    category:  Option<String>,
    /// Only keys overridable on this dimension.
    #[arg(long)]
    dimension: Option<ScopeDimension>,
  },
  /// Show one key definition.
  Show { key: String },
  /// Change a key definition.
  Update {
    key:           String,
    #[arg(long)]
    description:   Option<String>,
    #[arg(long)]
    category:      Option<String>,
    #[arg(long = "type")]
    declared_type: Option<DeclaredType>,
    /// Replace the allowed dimensions; repeatable.
    #[arg(long = "scope")]
    scopes:        Vec<ScopeDimension>,
    /// Allow only the global scope.
    #[arg(long, conflicts_with = "scopes")]
    global_only:   bool,
    /// New default value as JSON text.
    #[arg(long)]
    default:       Option<String>,
    #[arg(long, conflicts_with = "default")]
    clear_default: bool,
  },
  /// Remove a key that has no stored values.
  Remove { key: String },
  /// Resolve the effective value of a key.
  Get {
    key:   String,
    #[command(flatten)]
    ctx:   ContextArgs,
    /// Resolve as of this RFC 3339 instant, bypassing the cache.
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
  },
  /// Write a new version of a value.
  Put {
    key:            String,
    /// Raw value; parsed according to the key's declared type.
    value:          String,
    /// `global` or `<dimension>=<value>`.
    #[arg(long, default_value = "global")]
    scope:          Scope,
    #[arg(long)]
    effective_from: Option<DateTime<Utc>>,
  },
  /// Deactivate a stored value.
  Deactivate { record_id: Uuid },
  /// Show every version of a value, newest first.
  History {
    key:   String,
    #[arg(long, default_value = "global")]
    scope: Scope,
  },
  /// Write a JSON array of items atomically (`-` reads stdin).
  Bulk { file: PathBuf },
  /// Export definitions and current values.
  Export {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    scope:    Option<Scope>,
    /// Write to a file instead of stdout.
    #[arg(short, long)]
    output:   Option<PathBuf>,
  },
  /// Import an export document (`-` reads stdin).
  Import {
    file:           PathBuf,
    /// Define keys that are not registered yet.
    #[arg(long)]
    define_missing: bool,
  },
}

#[derive(Args)]
pub struct ContextArgs {
  #[arg(long)]
  persona:  Option<String>,
  #[arg(long)]
  agent:    Option<String>,
  #[arg(long)]
  workflow: Option<String>,
}

impl From<ContextArgs> for ScopeContext {
  fn from(args: ContextArgs) -> Self {
    ScopeContext {
      persona:     args.persona,
      agent_id:    args.agent,
      workflow_id: args.workflow,
    }
  }
}

pub async fn run<S>(
  service: &ConfigService<S>,
  actor: &str,
  command: Command,
) -> anyhow::Result<Value>
where
  S: ConfigStore + 'static,
{
  match command {
    Command::Define {
      key,
      declared_type,
      description,
      category,
      scopes,
      default,
    } => {
      let mut new = NewKeyDefinition::new(key, declared_type)
        .description(description)
        .category(category)
        .scopes(scopes);
      if let Some(default) = default {
        new = new.default_value(parse_json(&default)?);
      }
      json(service.define_key(new).await?)
    }
    Command::Keys {
      category,
      dimension,
    } => {
      let filter = KeyFilter {
        category,
        scope_dimension: dimension,
      };
      let keys: Vec<_> = service.list_keys(filter).try_collect().await?;
      json(keys)
    }
    Command::Show { key } => json(service.get_key(&key).await?),
    Command::Update {
      key,
      description,
      category,
      declared_type,
      scopes,
      global_only,
      default,
      clear_default,
    } => {
      let allowed_scopes = if global_only {
        Some(BTreeSet::new())
      } else if scopes.is_empty() {
        None
      } else {
        Some(scopes.into_iter().collect())
      };
      let default_value = match (default, clear_default) {
        (_, true) => Some(None),
        (Some(raw), false) => Some(Some(parse_json(&raw)?)),
        (None, false) => None,
      };
      let patch = KeyPatch {
        description,
        category,
        declared_type,
        allowed_scopes,
        default_value,
      };
      anyhow::ensure!(!patch.is_empty(), "nothing to update");
      json(service.update_key(&key, patch).await?)
    }
    Command::Remove { key } => {
      service.remove_key(&key).await?;
      Ok(serde_json::json!({ "removed": key }))
    }
    Command::Get { key, ctx, as_of } => {
      let ctx = ScopeContext::from(ctx);
      let resolution = match as_of {
        Some(at) => service.get_value_as_of(&key, &ctx, at).await?,
        None => service.get_value(&key, &ctx).await?,
      };
      json(resolution)
    }
    Command::Put {
      key,
      value,
      scope,
      effective_from,
    } => {
      let mut put = PutValue::new(key, scope, Value::String(value));
      put.effective_from = effective_from;
      json(service.put_value(put, actor).await?)
    }
    Command::Deactivate { record_id } => {
      json(service.deactivate_value(record_id, actor).await?)
    }
    Command::History { key, scope } => {
      json(service.get_history(&key, &scope).await?)
    }
    Command::Bulk { file } => {
      let items: Vec<BulkItem> = serde_json::from_str(&read_input(&file)?)
        .context("bulk input must be a JSON array of items")?;
      json(service.bulk_put(items, actor).await?)
    }
    Command::Export {
      category,
      scope,
      output,
    } => {
      let doc = service.export(&ExportFilter { category, scope }).await?;
      match output {
        Some(path) => {
          let text = serde_json::to_string_pretty(&doc)?;
          std::fs::write(&path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
          Ok(serde_json::json!({
            "written": path.display().to_string(),
            "entries": doc.entries.len(),
            "checksum": doc.checksum,
          }))
        }
        None => json(doc),
      }
    }
    Command::Import {
      file,
      define_missing,
    } => {
      let doc: ExportDocument = serde_json::from_str(&read_input(&file)?)
        .context("input is not an export document")?;
      let mode = if define_missing {
        ImportMode::DefineMissing
      } else {
        ImportMode::RequireKeys
      };
      json(service.import(doc, mode, actor).await?)
    }
  }
}

/// Item-level problems carried by a validation error, if any.
pub fn problems(err: &anyhow::Error) -> Option<Value> {
  match err.downcast_ref::<Error>()? {
    Error::BulkValidation(problems) => serde_json::to_value(problems).ok(),
    Error::ImportValidation(problems) => serde_json::to_value(problems).ok(),
    _ => None,
  }
}

fn json(value: impl Serialize) -> anyhow::Result<Value> {
  Ok(serde_json::to_value(value)?)
}

fn parse_json(raw: &str) -> anyhow::Result<Value> {
  serde_json::from_str(raw).with_context(|| format!("{raw:?} is not valid JSON"))
}

fn read_input(path: &Path) -> anyhow::Result<String> {
  if path == Path::new("-") {
    let mut buf = String::new();
    std::io::stdin()
      .read_to_string(&mut buf)
      .context("failed to read stdin")?;
    Ok(buf)
  } else {
    std::fs::read_to_string(path)
      .with_context(|| format!("failed to read {}", path.display()))
  }
}
