//! [`SqliteStore`], the SQLite implementation of [`ConfigStore`].

use std::{path::Path, time::Duration};

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{ErrorCode, OptionalExtension as _, TransactionBehavior};
use uuid::Uuid;

use scopecfg_core::{
  key::{ConfigKeyDefinition, KeyFilter},
  record::{ConfigValueRecord, NewRecord},
  scope::Scope,
  store::{AppendOutcome, ConfigStore, DeleteOutcome, InsertOutcome, UpdateOutcome},
};

use crate::{
  Result,
  encode::{
    DEFINITION_COLUMNS, RECORD_COLUMNS, RawDefinition, RawRecord, decode_dt,
    decode_scope, encode_dimensions, encode_dt, encode_scope, encode_type, encode_uuid,
  },
  schema::SCHEMA,
};

/// How long a connection waits on another process's write lock before the
/// attempt is reported as a conflict.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// A config store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

/// Outcome of the append transaction before it is mapped back onto the
/// caller's input. Indices point into the submitted definitions or records.
enum RawAppend {
  Appended(Vec<i64>),
  DuplicateKey(usize),
  UnknownKey(usize),
  TypeChanged(usize),
  Conflict(usize),
}

/// A definition flattened to its column values.
struct DefinitionRow {
  key:            String,
  description:    String,
  declared_type:  &'static str,
  category:       String,
  allowed_scopes: String,
  default_json:   Option<String>,
  created_at:     String,
  updated_at:     String,
}

impl DefinitionRow {
  fn encode(def: &ConfigKeyDefinition) -> Result<Self> {
    Ok(Self {
      key:            def.key.clone(),
      description:    def.description.clone(),
      declared_type:  encode_type(def.declared_type),
      category:       def.category.clone(),
      allowed_scopes: encode_dimensions(&def.allowed_scopes)?,
      default_json:   def
        .default_value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?,
      created_at:     encode_dt(def.created_at),
      updated_at:     encode_dt(def.updated_at),
    })
  }

  /// Insert unless the key exists. Returns whether a row was written.
  fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<bool> {
    let n = conn.execute(
      "INSERT INTO config_keys (
         key, description, declared_type, category,
         allowed_scopes, default_json, created_at, updated_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
       ON CONFLICT (key) DO NOTHING",
      rusqlite::params![
        self.key,
        self.description,
        self.declared_type,
        self.category,
        self.allowed_scopes,
        self.default_json,
        self.created_at,
        self.updated_at,
      ],
    )?;
    Ok(n == 1)
  }
}

/// A new record flattened to its column values.
struct RecordRow {
  record_id:      String,
  config_key:     String,
  declared_type:  &'static str,
  dimension:      String,
  scope_value:    String,
  value_json:     String,
  effective_from: String,
  created_at:     String,
  created_by:     String,
}

/// Lock contention and uniqueness violations both mean another writer got
/// to the tuple first.
fn is_conflict(e: &rusqlite::Error) -> bool {
  matches!(
    e,
    rusqlite::Error::SqliteFailure(f, _)
      if matches!(
        f.code,
        ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
      )
  )
}

/// Drop sub-microsecond precision so in-memory values match what a later
/// read decodes.
fn trunc(dt: DateTime<Utc>) -> DateTime<Utc> { dt.trunc_subsecs(6) }

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, mostly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── ConfigStore impl ────────────────────────────────────────────────────────

impl ConfigStore for SqliteStore {
  type Error = crate::Error;

  // ── Key registry ──────────────────────────────────────────────────────────

  async fn insert_definition(&self, def: ConfigKeyDefinition) -> Result<InsertOutcome> {
    let row = DefinitionRow::encode(&def)?;

    let inserted = self.conn.call(move |conn| Ok(row.insert(conn)?)).await?;

    Ok(if inserted {
      InsertOutcome::Inserted
    } else {
      InsertOutcome::AlreadyExists
    })
  }

  async fn get_definition(&self, key: &str) -> Result<Option<ConfigKeyDefinition>> {
    let key = key.to_owned();

    let raw: Option<RawDefinition> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {DEFINITION_COLUMNS} FROM config_keys WHERE key = ?1"),
            rusqlite::params![key],
            RawDefinition::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawDefinition::into_definition).transpose()
  }

  async fn list_definitions(
    &self,
    filter: &KeyFilter,
    after:  Option<&str>,
    limit:  usize,
  ) -> Result<Vec<ConfigKeyDefinition>> {
    let category  = filter.category.clone();
    let dimension = filter.scope_dimension.map(|d| d.to_string());
    let after     = after.map(str::to_owned);
    let limit_val = i64::try_from(limit).unwrap_or(i64::MAX);

    let raws: Vec<RawDefinition> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {DEFINITION_COLUMNS}
           FROM config_keys
           WHERE (?1 IS NULL OR category = ?1)
             AND (?2 IS NULL OR EXISTS (
                   SELECT 1 FROM json_each(config_keys.allowed_scopes)
                   WHERE json_each.value = ?2))
             AND (?3 IS NULL OR key > ?3)
           ORDER BY key ASC
           LIMIT ?4"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![category, dimension, after, limit_val],
            RawDefinition::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawDefinition::into_definition).collect()
  }

  async fn update_definition(&self, def: ConfigKeyDefinition) -> Result<UpdateOutcome> {
    let scopes_str  = encode_dimensions(&def.allowed_scopes)?;
    let default_str = def
      .default_value
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?;
    let type_str    = encode_type(def.declared_type);
    let updated_str = encode_dt(def.updated_at);

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stored_type: Option<String> = tx
          .query_row(
            "SELECT declared_type FROM config_keys WHERE key = ?1",
            rusqlite::params![def.key],
            |r| r.get(0),
          )
          .optional()?;
        let Some(stored_type) = stored_type else {
          return Ok(UpdateOutcome::NotFound);
        };

        if stored_type != type_str {
          let records: i64 = tx.query_row(
            "SELECT COUNT(*) FROM config_values WHERE config_key = ?1",
            rusqlite::params![def.key],
            |r| r.get(0),
          )?;
          if records > 0 {
            return Ok(UpdateOutcome::TypeLocked);
          }
        }

        tx.execute(
          "UPDATE config_keys
           SET description = ?2, declared_type = ?3, category = ?4,
               allowed_scopes = ?5, default_json = ?6, updated_at = ?7
           WHERE key = ?1",
          rusqlite::params![
            def.key,
            def.description,
            type_str,
            def.category,
            scopes_str,
            default_str,
            updated_str,
          ],
        )?;
        tx.commit()?;
        Ok(UpdateOutcome::Updated)
      })
      .await?;

    Ok(outcome)
  }

  async fn delete_definition(&self, key: &str) -> Result<DeleteOutcome> {
    let key = key.to_owned();

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
          .query_row(
            "SELECT 1 FROM config_keys WHERE key = ?1",
            rusqlite::params![key],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);
        if !exists {
          return Ok(DeleteOutcome::NotFound);
        }

        let records: i64 = tx.query_row(
          "SELECT COUNT(*) FROM config_values WHERE config_key = ?1",
          rusqlite::params![key],
          |r| r.get(0),
        )?;
        if records > 0 {
          return Ok(DeleteOutcome::InUse(records.unsigned_abs()));
        }

        tx.execute("DELETE FROM config_keys WHERE key = ?1", rusqlite::params![key])?;
        tx.commit()?;
        Ok(DeleteOutcome::Deleted)
      })
      .await?;

    Ok(outcome)
  }

  // ── Value records ─────────────────────────────────────────────────────────

  async fn define_and_append(
    &self,
    definitions: Vec<ConfigKeyDefinition>,
    records:     Vec<NewRecord>,
  ) -> Result<AppendOutcome> {
    if definitions.is_empty() && records.is_empty() {
      return Ok(AppendOutcome::Appended(Vec::new()));
    }

    let def_rows = definitions
      .iter()
      .map(DefinitionRow::encode)
      .collect::<Result<Vec<_>>>()?;

    let mut pending: Vec<(Uuid, NewRecord)> = Vec::with_capacity(records.len());
    let mut rows = Vec::with_capacity(records.len());
    for mut record in records {
      record.effective_from = trunc(record.effective_from);
      record.created_at     = trunc(record.created_at);

      let record_id                = Uuid::new_v4();
      let (dimension, scope_value) = encode_scope(&record.scope);
      rows.push(RecordRow {
        record_id: encode_uuid(record_id),
        config_key: record.config_key.clone(),
        declared_type: encode_type(record.declared_type),
        dimension,
        scope_value,
        value_json: serde_json::to_string(&record.value)?,
        effective_from: encode_dt(record.effective_from),
        created_at: encode_dt(record.created_at),
        created_by: record.created_by.clone(),
      });
      pending.push((record_id, record));
    }

    let raw = self
      .conn
      .call(move |conn| {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
          Ok(tx) => tx,
          Err(e) if is_conflict(&e) => return Ok(RawAppend::Conflict(0)),
          Err(e) => return Err(e.into()),
        };

        for (idx, def) in def_rows.iter().enumerate() {
          if !def.insert(&tx)? {
            return Ok(RawAppend::DuplicateKey(idx));
          }
        }

        let mut versions = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
          let stored_type: Option<String> = tx
            .query_row(
              "SELECT declared_type FROM config_keys WHERE key = ?1",
              rusqlite::params![row.config_key],
              |r| r.get(0),
            )
            .optional()?;
          match stored_type {
            None => return Ok(RawAppend::UnknownKey(idx)),
            Some(t) if t != row.declared_type => return Ok(RawAppend::TypeChanged(idx)),
            Some(_) => {}
          }

          let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM config_values
             WHERE config_key = ?1 AND scope_dimension = ?2 AND scope_value = ?3",
            rusqlite::params![row.config_key, row.dimension, row.scope_value],
            |r| r.get(0),
          )?;

          let inserted = tx.execute(
            "INSERT INTO config_values (
               record_id, config_key, scope_dimension, scope_value, value_json,
               version, effective_from, is_active, created_at, created_by
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
            rusqlite::params![
              row.record_id,
              row.config_key,
              row.dimension,
              row.scope_value,
              row.value_json,
              next,
              row.effective_from,
              row.created_at,
              row.created_by,
            ],
          );
          match inserted {
            Ok(_) => versions.push(next),
            Err(e) if is_conflict(&e) => return Ok(RawAppend::Conflict(idx)),
            Err(e) => return Err(e.into()),
          }
        }

        match tx.commit() {
          Ok(()) => Ok(RawAppend::Appended(versions)),
          Err(e) if is_conflict(&e) => Ok(RawAppend::Conflict(0)),
          Err(e) => Err(e.into()),
        }
      })
      .await?;

    Ok(match raw {
      RawAppend::Appended(versions) => AppendOutcome::Appended(
        pending
          .into_iter()
          .zip(versions)
          .map(|((record_id, r), version)| ConfigValueRecord {
            record_id,
            config_key: r.config_key,
            scope: r.scope,
            value: r.value,
            version: version.unsigned_abs(),
            effective_from: r.effective_from,
            is_active: true,
            created_at: r.created_at,
            created_by: r.created_by,
            deactivated_at: None,
            deactivated_by: None,
          })
          .collect(),
      ),
      RawAppend::DuplicateKey(idx) => {
        let mut definitions = definitions;
        AppendOutcome::DuplicateKey(definitions.swap_remove(idx).key)
      }
      RawAppend::UnknownKey(idx) => {
        AppendOutcome::UnknownKey(pending.swap_remove(idx).1.config_key)
      }
      RawAppend::TypeChanged(idx) => {
        AppendOutcome::TypeChanged(pending.swap_remove(idx).1.config_key)
      }
      RawAppend::Conflict(idx) => {
        // A failed BEGIN or COMMIT reports index 0, which may not exist
        // when only definitions were submitted.
        match pending.into_iter().nth(idx) {
          Some((_, r)) => AppendOutcome::Conflict { config_key: r.config_key, scope: r.scope },
          None => AppendOutcome::Conflict {
            config_key: definitions.first().map(|d| d.key.clone()).unwrap_or_default(),
            scope:      Scope::Global,
          },
        }
      }
    })
  }

  async fn get_record(&self, record_id: Uuid) -> Result<Option<ConfigValueRecord>> {
    let id_str = encode_uuid(record_id);

    let raw: Option<RawRecord> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM config_values WHERE record_id = ?1"),
            rusqlite::params![id_str],
            RawRecord::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawRecord::into_record).transpose()
  }

  async fn deactivate_record(
    &self,
    record_id: Uuid,
    at:        DateTime<Utc>,
    by:        String,
  ) -> Result<Option<ConfigValueRecord>> {
    let id_str = encode_uuid(record_id);
    let at_str = encode_dt(at);

    let raw: Option<RawRecord> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
          "UPDATE config_values
           SET is_active = 0, deactivated_at = ?2, deactivated_by = ?3
           WHERE record_id = ?1 AND is_active = 1",
          rusqlite::params![id_str, at_str, by],
        )?;
        let raw = tx
          .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM config_values WHERE record_id = ?1"),
            rusqlite::params![id_str],
            RawRecord::from_row,
          )
          .optional()?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.map(RawRecord::into_record).transpose()
  }

  async fn history(&self, config_key: &str, scope: &Scope) -> Result<Vec<ConfigValueRecord>> {
    let key          = config_key.to_owned();
    let (dim, value) = encode_scope(scope);

    let raws: Vec<RawRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RECORD_COLUMNS} FROM config_values
           WHERE config_key = ?1 AND scope_dimension = ?2 AND scope_value = ?3
           ORDER BY version DESC"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![key, dim, value], RawRecord::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRecord::into_record).collect()
  }

  async fn current_candidate(
    &self,
    config_key: &str,
    scope:      &Scope,
    as_of:      DateTime<Utc>,
  ) -> Result<Option<ConfigValueRecord>> {
    let key          = config_key.to_owned();
    let (dim, value) = encode_scope(scope);
    let as_of_str    = encode_dt(as_of);

    let raw: Option<RawRecord> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {RECORD_COLUMNS} FROM config_values
               WHERE config_key = ?1 AND scope_dimension = ?2 AND scope_value = ?3
                 AND is_active = 1 AND effective_from <= ?4
               ORDER BY version DESC
               LIMIT 1"
            ),
            rusqlite::params![key, dim, value, as_of_str],
            RawRecord::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawRecord::into_record).transpose()
  }

  async fn next_effective_after(
    &self,
    config_key: &str,
    scopes:     &[Scope],
    after:      DateTime<Utc>,
  ) -> Result<Option<DateTime<Utc>>> {
    if scopes.is_empty() {
      return Ok(None);
    }

    // Parameters: key, after, then one (dimension, value) pair per scope.
    let mut params = vec![config_key.to_owned(), encode_dt(after)];
    let mut tuples = Vec::with_capacity(scopes.len());
    for scope in scopes {
      let (dim, value) = encode_scope(scope);
      let n = params.len();
      tuples.push(format!(
        "(scope_dimension = ?{} AND scope_value = ?{})",
        n + 1,
        n + 2
      ));
      params.push(dim);
      params.push(value);
    }
    let sql = format!(
      "SELECT MIN(effective_from) FROM config_values
       WHERE config_key = ?1 AND is_active = 1 AND effective_from > ?2
         AND ({})",
      tuples.join(" OR ")
    );

    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params), |r| r.get(0))?)
      })
      .await?;

    raw.as_deref().map(decode_dt).transpose()
  }

  async fn scopes_for_key(&self, config_key: &str) -> Result<Vec<Scope>> {
    let key = config_key.to_owned();

    let raws: Vec<(String, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT scope_dimension, scope_value FROM config_values
           WHERE config_key = ?1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![key], |r| Ok((r.get(0)?, r.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let mut scopes = raws
      .into_iter()
      .map(|(dim, value)| decode_scope(&dim, value))
      .collect::<Result<Vec<_>>>()?;
    scopes.sort();
    Ok(scopes)
  }
}
