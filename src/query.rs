//! Query observers: the consumer side of the query cache.
//!
//! Inspired by TanStack Query's `useQuery`, a [`Query`] is what a screen or a
//! long-running command holds for one key. It subscribes to the key when it
//! is created, fetches on demand through the shared [`QueryClient`] (so two
//! observers of one key share one request), and exposes a pollable
//! [`QueryState`] fed by the cache's change notifications.
//!
//! # Example
//!
//! ```ignore
//! let mut query = hub.observe::<Vec<DiscussionPost>>(HubKey::Discussion);
//!
//! // Fetch if the cached entry is stale
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, redraw
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(posts) => render_posts(posts),
//!     QueryState::Error(e) => render_error(e, query.data()),
//!     QueryState::Idle => {}
//! }
//! ```

use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{
  EntrySnapshot, QueryClient, QueryFn, QueryKey, QueryOptions, QueryStatus, Subscription,
};
use crate::error::Error;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Observer of one cache key, decoding its data into `T`.
///
/// Dropping the query unsubscribes it; the cache entry is then evicted once
/// the client's GC window passes with no other observer.
pub struct Query<K: QueryKey, T> {
  key: K,
  client: QueryClient<K>,
  fetcher: QueryFn,
  options: QueryOptions,
  state: QueryState<T>,
  data: Option<T>,
  fetched_at: Option<Instant>,
  receiver: mpsc::UnboundedReceiver<EntrySnapshot<K>>,
  _subscription: Subscription<K>,
}

impl<K: QueryKey, T: DeserializeOwned + Clone> Query<K, T> {
  /// Subscribe to `key`. Nothing is fetched until [`Query::fetch`] is called.
  pub fn new(client: &QueryClient<K>, key: K, fetcher: QueryFn) -> Self {
    let (tx, receiver) = mpsc::unbounded_channel();
    let subscription = client.subscribe(key.clone(), move |snapshot| {
      // Ignore send errors - the query may have been dropped
      let _ = tx.send(snapshot.clone());
    });

    Self {
      key,
      client: client.clone(),
      fetcher,
      options: QueryOptions::new(),
      state: QueryState::Idle,
      data: None,
      fetched_at: None,
      receiver,
      _subscription: subscription,
    }
  }

  /// Override the client's stale time for this key.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.options = self.options.stale_time(duration);
    self
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &K {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Latest successfully fetched data.
  ///
  /// Unlike [`QueryState::data`] this survives a refetch in progress and a
  /// failed refetch.
  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  /// Check if the cached entry would be refetched by [`Query::fetch`].
  pub fn is_stale(&self) -> bool {
    self.client.is_stale(&self.key)
  }

  /// Fetch if the cached entry is stale.
  ///
  /// Joins a fetch already in flight for the key, from this observer or any
  /// other consumer.
  pub fn fetch(&mut self) {
    let result = self
      .client
      .prefetch(self.key.clone(), Arc::clone(&self.fetcher), self.options);
    if let Err(err) = result {
      self.state = QueryState::Error(err.to_string());
    }
  }

  /// Fetch regardless of freshness.
  pub fn refetch(&mut self) {
    let result = self
      .client
      .refetch_with(self.key.clone(), Arc::clone(&self.fetcher), self.options);
    if let Err(err) = result {
      self.state = QueryState::Error(err.to_string());
    }
  }

  /// Apply pending cache notifications.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    loop {
      match self.receiver.try_recv() {
        Ok(snapshot) => {
          self.apply(snapshot);
          changed = true;
        }
        Err(mpsc::error::TryRecvError::Empty) => break,
        Err(mpsc::error::TryRecvError::Disconnected) => {
          // The client dropped every subscription
          if !self.state.is_error() {
            self.state = QueryState::Error(Error::Disposed.to_string());
            changed = true;
          }
          break;
        }
      }
    }
    changed
  }

  fn apply(&mut self, snapshot: EntrySnapshot<K>) {
    self.fetched_at = snapshot.fetched_at;
    if let Some(value) = snapshot.data {
      match serde_json::from_value::<T>(value) {
        Ok(data) => self.data = Some(data),
        Err(err) => {
          self.state = QueryState::Error(Error::from(err).to_string());
          return;
        }
      }
    }

    self.state = match snapshot.status {
      QueryStatus::Idle => QueryState::Idle,
      QueryStatus::Loading => QueryState::Loading,
      QueryStatus::Success => match &self.data {
        Some(data) => QueryState::Success(data.clone()),
        None => QueryState::Idle,
      },
      QueryStatus::Error => QueryState::Error(
        snapshot
          .error
          .map(|err| err.to_string())
          .unwrap_or_else(|| "unknown error".to_string()),
      ),
    };
  }
}

impl<K: QueryKey, T: fmt::Debug> fmt::Debug for Query<K, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
