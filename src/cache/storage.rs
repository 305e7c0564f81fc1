//! In-memory resource cache.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::entry::{CacheEntry, QueryStatus};
use super::key::{KeyPrefix, QueryKey};
use crate::error::Error;

/// Mapping from key to cached server state.
///
/// Pure data structure: no I/O, no locking, no notifications. The
/// [`QueryClient`](super::QueryClient) owns one behind its state lock and
/// decides when to fetch and whom to notify.
#[derive(Debug)]
pub struct ResourceCache<K> {
  entries: HashMap<K, CacheEntry<K>>,
  /// Stale time given to entries created without explicit options
  default_stale_time: Duration,
}

impl<K: QueryKey> ResourceCache<K> {
  pub fn new(default_stale_time: Duration) -> Self {
    Self {
      entries: HashMap::new(),
      default_stale_time,
    }
  }

  /// Look up an entry. No side effects.
  pub fn get(&self, key: &K) -> Option<&CacheEntry<K>> {
    self.entries.get(key)
  }

  pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut CacheEntry<K>> {
    self.entries.get_mut(key)
  }

  /// Get the entry for `key`, creating an idle one if needed.
  pub(crate) fn entry_mut(&mut self, key: &K) -> &mut CacheEntry<K> {
    let stale_time = self.default_stale_time;
    self
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone(), stale_time))
  }

  /// Store fresh data for `key`.
  pub fn set(&mut self, key: &K, data: Value) {
    let entry = self.entry_mut(key);
    entry.data = Some(data);
    entry.error = None;
    entry.status = QueryStatus::Success;
    entry.fetched_at = Some(Instant::now());
    entry.invalidated = false;
  }

  /// Record a failed fetch. Previously cached data is kept.
  pub fn set_error(&mut self, key: &K, error: Error) {
    let entry = self.entry_mut(key);
    entry.error = Some(error);
    entry.status = QueryStatus::Error;
  }

  /// Mark every entry under `prefix` as stale and return the affected keys.
  pub fn invalidate(&mut self, prefix: &KeyPrefix) -> Vec<K> {
    self
      .entries
      .values_mut()
      .filter(|entry| prefix.matches(&entry.key))
      .map(|entry| {
        entry.invalidated = true;
        entry.invalidation_epoch += 1;
        entry.key.clone()
      })
      .collect()
  }

  /// Check whether an entry needs a refetch right now.
  pub fn is_stale(&self, entry: &CacheEntry<K>) -> bool {
    entry.is_stale_at(Instant::now())
  }

  pub fn remove(&mut self, key: &K) -> Option<CacheEntry<K>> {
    self.entries.remove(key)
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn keys(&self) -> impl Iterator<Item = &K> {
    self.entries.keys()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
