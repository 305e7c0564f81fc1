//! Cache entries and the snapshots handed to subscribers.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Factory producing the future that fetches a resource.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Box a closure returning a future into a [`QueryFn`].
pub fn query_fn<F, Fut>(fetcher: F) -> QueryFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value>> + Send + 'static,
{
  Arc::new(move || fetcher().boxed())
}

/// Handle to a fetch that every interested caller can await.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Value>>>;

/// Lifecycle of a cache entry.
///
/// `Idle -> Loading -> {Success, Error}`. Only the completion of a fetch
/// moves an entry out of `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Known to the cache but never fetched
  Idle,
  /// A fetch is in flight
  Loading,
  /// The last fetch succeeded
  Success,
  /// The last fetch failed
  Error,
}

/// The single fetch currently allowed for a key.
pub(crate) struct InFlight {
  pub id: u64,
  /// Invalidation epoch observed when the fetch started
  pub started_epoch: u64,
  pub handle: SharedFetch,
}

/// Server-derived state for one key.
pub struct CacheEntry<K> {
  pub(crate) key: K,
  pub(crate) data: Option<Value>,
  pub(crate) error: Option<Error>,
  pub(crate) status: QueryStatus,
  pub(crate) fetched_at: Option<Instant>,
  /// Zero means the data is stale as soon as it lands
  pub(crate) stale_after: Duration,
  pub(crate) invalidated: bool,
  pub(crate) invalidation_epoch: u64,
  pub(crate) in_flight: Option<InFlight>,
  pub(crate) fetcher: Option<QueryFn>,
  /// Overrides the client-wide retry count
  pub(crate) retry: Option<u32>,
  /// Bumped on every subscribe/GC scheduling; a GC timer only evicts if it
  /// still holds the latest epoch.
  pub(crate) gc_epoch: u64,
}

impl<K: Clone> CacheEntry<K> {
  pub(crate) fn new(key: K, stale_after: Duration) -> Self {
    Self {
      key,
      data: None,
      error: None,
      status: QueryStatus::Idle,
      fetched_at: None,
      stale_after,
      invalidated: false,
      invalidation_epoch: 0,
      in_flight: None,
      fetcher: None,
      retry: None,
      gc_epoch: 0,
    }
  }

  pub fn key(&self) -> &K {
    &self.key
  }

  pub fn data(&self) -> Option<&Value> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&Error> {
    self.error.as_ref()
  }

  pub fn status(&self) -> QueryStatus {
    self.status
  }

  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  pub fn stale_after(&self) -> Duration {
    self.stale_after
  }

  pub fn is_invalidated(&self) -> bool {
    self.invalidated
  }

  pub fn is_fetching(&self) -> bool {
    self.in_flight.is_some()
  }

  /// Check whether the entry must be refetched before being served.
  pub fn is_stale_at(&self, now: Instant) -> bool {
    if self.invalidated || self.stale_after.is_zero() {
      return true;
    }
    match self.fetched_at {
      Some(fetched_at) => now.saturating_duration_since(fetched_at) > self.stale_after,
      None => true,
    }
  }

  pub(crate) fn snapshot(&self, now: Instant) -> EntrySnapshot<K> {
    EntrySnapshot {
      key: self.key.clone(),
      data: self.data.clone(),
      error: self.error.clone(),
      status: self.status,
      is_fetching: self.is_fetching(),
      is_stale: self.is_stale_at(now),
      fetched_at: self.fetched_at,
    }
  }
}

impl<K: fmt::Debug> fmt::Debug for CacheEntry<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("key", &self.key)
      .field("status", &self.status)
      .field("has_data", &self.data.is_some())
      .field("error", &self.error)
      .field("fetched_at", &self.fetched_at)
      .field("stale_after", &self.stale_after)
      .field("invalidated", &self.invalidated)
      .field("in_flight", &self.in_flight.as_ref().map(|f| f.id))
      .finish_non_exhaustive()
  }
}

/// Point-in-time copy of an entry, delivered to subscribers.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<K> {
  pub key: K,
  pub data: Option<Value>,
  pub error: Option<Error>,
  pub status: QueryStatus,
  pub is_fetching: bool,
  pub is_stale: bool,
  pub fetched_at: Option<Instant>,
}
