//! Resolution cache with soft and hard TTLs.
//!
//! Entries are grouped per key so a write can drop every context of that key
//! at once. Each key also carries a generation counter: readers capture it
//! before resolving and [`ResolutionCache::insert`] refuses the result if an
//! invalidation happened in between.
//!
//! Entries past the hard TTL are discarded, not just hidden: a lookup evicts
//! the one it finds, an insert prunes its own key, and every
//! [`SWEEP_EVERY`] inserts the whole cache is swept.

use std::{
  collections::HashMap,
  sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use scopecfg_core::{record::Resolution, scope::ScopeContext};
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

/// Inserts between full sweeps for hard-expired entries.
pub const SWEEP_EVERY: u64 = 64;

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
  Fresh(Resolution),
  /// Past the soft TTL but still servable.
  Stale(Resolution),
  Miss,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
  pub hits:          u64,
  pub stale_hits:    u64,
  pub misses:        u64,
  pub invalidations: u64,
  /// Entries discarded after their hard TTL.
  pub evictions:     u64,
  pub entries:       usize,
}

#[derive(Debug)]
struct Entry {
  resolution: Resolution,
  stale_at:   DateTime<Utc>,
  expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct KeySlot {
  generation:  u64,
  entries:     HashMap<ScopeContext, Entry>,
  /// Earliest `expires_at` among `entries`.
  next_expiry: Option<DateTime<Utc>>,
}

impl KeySlot {
  /// Drop entries expired at `now`. Returns how many went.
  fn purge(&mut self, now: DateTime<Utc>) -> usize {
    if self.next_expiry.is_none_or(|at| now < at) {
      return 0;
    }
    let before = self.entries.len();
    self.entries.retain(|_, entry| now < entry.expires_at);
    self.next_expiry = self.entries.values().map(|entry| entry.expires_at).min();
    before - self.entries.len()
  }

  fn clear(&mut self) {
    self.entries.clear();
    self.next_expiry = None;
    self.generation += 1;
  }
}

#[derive(Debug)]
pub struct ResolutionCache {
  slots:         DashMap<String, KeySlot>,
  soft_ttl:      Duration,
  hard_ttl:      Duration,
  hits:          AtomicU64,
  stale_hits:    AtomicU64,
  misses:        AtomicU64,
  invalidations: AtomicU64,
  evictions:     AtomicU64,
  inserts:       AtomicU64,
}

impl ResolutionCache {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      slots:         DashMap::new(),
      soft_ttl:      config.soft_ttl(),
      hard_ttl:      config.hard_ttl(),
      hits:          AtomicU64::new(0),
      stale_hits:    AtomicU64::new(0),
      misses:        AtomicU64::new(0),
      invalidations: AtomicU64::new(0),
      evictions:     AtomicU64::new(0),
      inserts:       AtomicU64::new(0),
    }
  }

  pub fn lookup(
    &self,
    key: &str,
    ctx: &ScopeContext,
    now: DateTime<Utc>,
  ) -> Lookup {
    let mut expired = false;
    let found = self.slots.get(key).and_then(|slot| {
      slot.entries.get(ctx).map(|entry| {
        if now >= entry.expires_at {
          expired = true;
          Lookup::Miss
        } else if now >= entry.stale_at {
          Lookup::Stale(entry.resolution.clone())
        } else {
          Lookup::Fresh(entry.resolution.clone())
        }
      })
    });
    if expired {
      self.evict(key, ctx, now);
    }

    let lookup = found.unwrap_or(Lookup::Miss);
    let counter = match lookup {
      Lookup::Fresh(_) => &self.hits,
      Lookup::Stale(_) => &self.stale_hits,
      Lookup::Miss => &self.misses,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    lookup
  }

  /// Current generation of `key`. Capture before resolving and pass to
  /// [`insert`](Self::insert).
  pub fn generation(&self, key: &str) -> u64 {
    self.slots.get(key).map_or(0, |slot| slot.generation)
  }

  /// Store a resolution computed at `now`. Returns `false` without storing
  /// if `key` was invalidated since `generation` was read.
  ///
  /// The entry goes stale after the soft TTL and expires after the hard TTL,
  /// both capped at `next_change`.
  pub fn insert(
    &self,
    key: &str,
    ctx: ScopeContext,
    resolution: Resolution,
    next_change: Option<DateTime<Utc>>,
    generation: u64,
    now: DateTime<Utc>,
  ) -> bool {
    {
      let mut slot = self.slots.entry(key.to_owned()).or_default();
      if slot.generation != generation {
        return false;
      }
      let purged = slot.purge(now);
      self.count_evictions(purged);

      let mut stale_at = now + self.soft_ttl;
      let mut expires_at = now + self.hard_ttl;
      if let Some(at) = next_change {
        stale_at = stale_at.min(at);
        expires_at = expires_at.min(at);
      }

      slot.entries.insert(ctx, Entry {
        resolution,
        stale_at,
        expires_at,
      });
      slot.next_expiry =
        Some(slot.next_expiry.map_or(expires_at, |at| at.min(expires_at)));
    }

    // The slot guard is released above; sweeping takes every shard lock.
    let inserted = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
    if inserted % SWEEP_EVERY == 0 {
      self.purge_expired(now);
    }
    true
  }

  /// Discard every entry past its hard TTL at `now`. Returns how many went.
  pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
    let purged = self
      .slots
      .iter_mut()
      .map(|mut slot| slot.purge(now))
      .sum::<usize>();
    self.count_evictions(purged);
    purged
  }

  fn evict(&self, key: &str, ctx: &ScopeContext, now: DateTime<Utc>) {
    let Some(mut slot) = self.slots.get_mut(key) else {
      return;
    };
    // Re-check: a fresh entry may have replaced it since the read.
    if slot.entries.get(ctx).is_some_and(|entry| now >= entry.expires_at) {
      slot.entries.remove(ctx);
      self.count_evictions(1);
    }
  }

  fn count_evictions(&self, n: usize) {
    if n > 0 {
      self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }
  }

  /// Drop every cached context of `key`.
  pub fn invalidate(&self, key: &str) {
    self.slots.entry(key.to_owned()).or_default().clear();
    self.invalidations.fetch_add(1, Ordering::Relaxed);
  }

  pub fn clear(&self) {
    for mut slot in self.slots.iter_mut() {
      slot.clear();
    }
    self.invalidations.fetch_add(1, Ordering::Relaxed);
  }

  pub fn len(&self) -> usize {
    self.slots.iter().map(|slot| slot.entries.len()).sum()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits:          self.hits.load(Ordering::Relaxed),
      stale_hits:    self.stale_hits.load(Ordering::Relaxed),
      misses:        self.misses.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      evictions:     self.evictions.load(Ordering::Relaxed),
      entries:       self.len(),
    }
  }
}
