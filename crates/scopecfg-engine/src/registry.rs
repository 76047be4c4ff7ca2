//! Key registry facade: store-backed definitions behind an in-memory cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, TryStreamExt, stream};
use scopecfg_core::{
  Error, Result,
  key::{ConfigKeyDefinition, KeyFilter, KeyPatch, NewKeyDefinition},
  store::{ConfigStore, DeleteOutcome, InsertOutcome, UpdateOutcome},
};

pub struct KeyRegistry<S> {
  store:     Arc<S>,
  cache:     DashMap<String, ConfigKeyDefinition>,
  page_size: usize,
}

impl<S: ConfigStore> KeyRegistry<S> {
  pub fn new(store: Arc<S>, page_size: usize) -> Self {
    Self {
      store,
      cache: DashMap::new(),
      page_size: page_size.max(1),
    }
  }

  pub async fn define(
    &self,
    new: NewKeyDefinition,
    now: DateTime<Utc>,
  ) -> Result<ConfigKeyDefinition> {
    let def = new.into_definition(now)?;
    match self
      .store
      .insert_definition(def.clone())
      .await
      .map_err(Error::store)?
    {
      InsertOutcome::Inserted => {
        self.cache.insert(def.key.clone(), def.clone());
        Ok(def)
      }
      InsertOutcome::AlreadyExists => Err(Error::DuplicateKey(def.key)),
    }
  }

  pub async fn get(&self, key: &str) -> Result<ConfigKeyDefinition> {
    if let Some(def) = self.cache.get(key) {
      return Ok(def.clone());
    }
    let def = self.fetch(key).await?;
    self.cache.insert(def.key.clone(), def.clone());
    Ok(def)
  }

  /// Stream every definition matching `filter` in key order, one store page
  /// at a time. Each call starts over from the first key.
  pub fn list(
    &self,
    filter: KeyFilter,
  ) -> impl Stream<Item = Result<ConfigKeyDefinition>> + Send + '_ {
    let page_size = self.page_size;
    stream::try_unfold(
      (filter, None::<String>, false),
      move |(filter, after, exhausted)| async move {
        if exhausted {
          return Ok::<_, Error>(None);
        }
        let page = self
          .store
          .list_definitions(&filter, after.as_deref(), page_size)
          .await
          .map_err(Error::store)?;
        let exhausted = page.len() < page_size;
        let after = page.last().map(|def| def.key.clone()).or(after);
        let items = stream::iter(page.into_iter().map(Ok::<_, Error>));
        Ok(Some((items, (filter, after, exhausted))))
      },
    )
    .try_flatten()
  }

  pub async fn list_all(
    &self,
    filter: KeyFilter,
  ) -> Result<Vec<ConfigKeyDefinition>> {
    self.list(filter).try_collect().await
  }

  /// Apply `patch`. The current definition is read from the store so
  /// concurrent edits from other processes are not clobbered by a cached
  /// copy.
  pub async fn update(
    &self,
    key: &str,
    patch: KeyPatch,
    now: DateTime<Utc>,
  ) -> Result<ConfigKeyDefinition> {
    let current = self.fetch(key).await?;
    let updated = patch.apply(current, now)?;
    let outcome = self
      .store
      .update_definition(updated.clone())
      .await
      .map_err(Error::store)?;
    match outcome {
      UpdateOutcome::Updated => {
        self.cache.insert(updated.key.clone(), updated.clone());
        Ok(updated)
      }
      UpdateOutcome::NotFound => {
        self.cache.remove(key);
        Err(Error::UnknownKey(key.to_owned()))
      }
      UpdateOutcome::TypeLocked => Err(Error::TypeLocked(key.to_owned())),
    }
  }

  pub async fn remove(&self, key: &str) -> Result<()> {
    let outcome = self
      .store
      .delete_definition(key)
      .await
      .map_err(Error::store)?;
    match outcome {
      DeleteOutcome::Deleted => {
        self.cache.remove(key);
        Ok(())
      }
      DeleteOutcome::NotFound => {
        self.cache.remove(key);
        Err(Error::UnknownKey(key.to_owned()))
      }
      DeleteOutcome::InUse(records) => Err(Error::KeyInUse {
        key: key.to_owned(),
        records,
      }),
    }
  }

  /// Drop the cached definition of `key`; the next read goes to the store.
  pub fn forget(&self, key: &str) { self.cache.remove(key); }

  /// Forget every cached definition.
  pub fn clear(&self) { self.cache.clear(); }

  async fn fetch(&self, key: &str) -> Result<ConfigKeyDefinition> {
    self
      .store
      .get_definition(key)
      .await
      .map_err(Error::store)?
      .ok_or_else(|| Error::UnknownKey(key.to_owned()))
  }
}
