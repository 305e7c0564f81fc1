//! Query client that orchestrates the cache, fetching and subscriptions.

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{query_fn, EntrySnapshot, InFlight, QueryFn, QueryStatus, SharedFetch};
use super::key::{KeyPrefix, QueryKey};
use super::storage::ResourceCache;
use super::subscription::{Callback, SubscriberId, Subscription, SubscriptionRegistry};
use crate::error::{Error, Result};

/// Client-wide cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryClientConfig {
  /// How long fetched data is served without refetching. Zero means every
  /// query refetches.
  pub stale_time: Duration,
  /// How long an unobserved entry is kept before eviction.
  pub gc_time: Duration,
  /// Extra attempts after a failed fetch.
  pub retry: u32,
}

impl Default for QueryClientConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::ZERO,
      gc_time: Duration::from_secs(300),
      retry: 0,
    }
  }
}

/// Per-query overrides of the client policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
  stale_time: Option<Duration>,
  retry: Option<u32>,
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn retry(mut self, retry: u32) -> Self {
    self.retry = Some(retry);
    self
  }
}

pub(crate) struct State<K> {
  cache: ResourceCache<K>,
  subscriptions: SubscriptionRegistry<K>,
  next_fetch_id: u64,
  disposed: bool,
}

/// Change notification waiting for the state lock to be released.
struct Notice<K> {
  snapshot: EntrySnapshot<K>,
  callbacks: Vec<Callback<K>>,
}

impl<K> Notice<K> {
  fn deliver(self) {
    for callback in &self.callbacks {
      callback(&self.snapshot);
    }
  }
}

impl<K: QueryKey> State<K> {
  fn notice(&self, key: &K) -> Option<Notice<K>> {
    let callbacks = self.subscriptions.callbacks(key);
    if callbacks.is_empty() {
      return None;
    }
    let entry = self.cache.get(key)?;
    Some(Notice {
      snapshot: entry.snapshot(Instant::now()),
      callbacks,
    })
  }
}

enum Lookup {
  Cached(Value),
  Pending(SharedFetch),
}

pub(crate) struct ClientInner<K: QueryKey> {
  state: Mutex<State<K>>,
  config: QueryClientConfig,
}

impl<K: QueryKey> ClientInner<K> {
  /// Serve from cache, join the in-flight fetch, or start a new one.
  ///
  /// `force` skips the freshness check but still joins an in-flight fetch.
  fn lookup(
    self: &Arc<Self>,
    key: &K,
    fetcher: Option<QueryFn>,
    options: QueryOptions,
    force: bool,
  ) -> Result<Lookup> {
    let (lookup, notice) = {
      let mut guard = self.state.lock();
      let state = &mut *guard;
      if state.disposed {
        return Err(Error::Disposed);
      }
      if fetcher.is_none() && state.cache.get(key).is_none() {
        return Err(Error::MalformedRequest(format!(
          "no query registered for {}",
          key.description()
        )));
      }

      let now = Instant::now();
      let fetch_id = state.next_fetch_id;
      let entry = state.cache.entry_mut(key);
      if let Some(fetcher) = fetcher {
        entry.fetcher = Some(fetcher);
      }
      if let Some(stale_time) = options.stale_time {
        entry.stale_after = stale_time;
      }
      if let Some(retry) = options.retry {
        entry.retry = Some(retry);
      }

      if !force && entry.status == QueryStatus::Success && !entry.is_stale_at(now) {
        if let Some(data) = &entry.data {
          debug!(key = %key.description(), "cache hit");
          return Ok(Lookup::Cached(data.clone()));
        }
      }

      if let Some(in_flight) = &entry.in_flight {
        debug!(key = %key.description(), fetch = in_flight.id, "joining in-flight fetch");
        return Ok(Lookup::Pending(in_flight.handle.clone()));
      }

      let fetcher = entry.fetcher.clone().ok_or_else(|| {
        Error::MalformedRequest(format!("no query function for {}", key.description()))
      })?;
      let retry = entry.retry.unwrap_or(self.config.retry);
      let handle = self.start_fetch(key.clone(), fetch_id, fetcher, retry);
      entry.status = QueryStatus::Loading;
      entry.in_flight = Some(InFlight {
        id: fetch_id,
        started_epoch: entry.invalidation_epoch,
        handle: handle.clone(),
      });
      state.next_fetch_id += 1;
      let hash = key.cache_hash();
      debug!(
        key = %key.description(),
        hash = &hash[..12],
        fetch = fetch_id,
        "starting fetch"
      );

      (Lookup::Pending(handle), state.notice(key))
    };

    if let Some(notice) = notice {
      notice.deliver();
    }
    Ok(lookup)
  }

  /// Build the shared fetch future and drive it on the runtime so it
  /// completes even if every caller goes away.
  fn start_fetch(self: &Arc<Self>, key: K, id: u64, fetcher: QueryFn, retry: u32) -> SharedFetch {
    let weak = Arc::downgrade(self);
    let handle = async move {
      let mut attempt = 0;
      let result = loop {
        match fetcher().await {
          Err(err) if attempt < retry => {
            attempt += 1;
            debug!(key = %key.description(), attempt, error = %err, "retrying fetch");
          }
          result => break result,
        }
      };
      if let Some(inner) = weak.upgrade() {
        inner.settle(&key, id, &result);
      }
      result
    }
    .boxed()
    .shared();

    match Handle::try_current() {
      Ok(runtime) => {
        let driver = handle.clone();
        runtime.spawn(async move {
          let _ = driver.await;
        });
      }
      Err(_) => warn!("no tokio runtime, fetch only progresses while awaited"),
    }

    handle
  }

  /// Write a fetch outcome into the cache and notify subscribers.
  fn settle(self: &Arc<Self>, key: &K, id: u64, result: &Result<Value>) {
    let (notice, unobserved) = {
      let mut guard = self.state.lock();
      let state = &mut *guard;
      if state.disposed {
        return;
      }

      let started_epoch = match state.cache.get(key) {
        Some(entry) => entry
          .in_flight
          .as_ref()
          .filter(|in_flight| in_flight.id == id)
          .map(|in_flight| in_flight.started_epoch),
        None => {
          debug!(key = %key.description(), fetch = id, "entry evicted, discarding result");
          return;
        }
      };

      match result {
        Ok(data) => state.cache.set(key, data.clone()),
        Err(err) => {
          warn!(key = %key.description(), error = %err, "fetch failed");
          state.cache.set_error(key, err.clone());
        }
      }

      if let Some(entry) = state.cache.get_mut(key) {
        match started_epoch {
          Some(epoch) => {
            entry.in_flight = None;
            // Invalidated while in flight: the result may predate the write.
            if entry.invalidation_epoch != epoch {
              entry.invalidated = true;
            }
          }
          // Entry was recreated and another fetch owns the slot
          None if entry.in_flight.is_some() => entry.status = QueryStatus::Loading,
          None => {}
        }
      }

      (state.notice(key), !state.subscriptions.is_observed(key))
    };

    if let Some(notice) = notice {
      notice.deliver();
    }
    if unobserved {
      self.schedule_gc(key);
    }
  }

  fn schedule_gc(self: &Arc<Self>, key: &K) {
    let epoch = {
      let mut state = self.state.lock();
      match state.cache.get_mut(key) {
        Some(entry) => {
          entry.gc_epoch += 1;
          entry.gc_epoch
        }
        None => return,
      }
    };

    let gc_time = self.config.gc_time;
    if gc_time.is_zero() {
      self.collect(key, epoch);
      return;
    }

    match Handle::try_current() {
      Ok(runtime) => {
        let weak = Arc::downgrade(self);
        let key = key.clone();
        runtime.spawn(async move {
          tokio::time::sleep(gc_time).await;
          if let Some(inner) = weak.upgrade() {
            inner.collect(&key, epoch);
          }
        });
      }
      Err(_) => self.collect(key, epoch),
    }
  }

  /// Evict `key` if nothing touched it since `epoch`.
  fn collect(&self, key: &K, epoch: u64) {
    let mut guard = self.state.lock();
    let state = &mut *guard;
    let idle = match state.cache.get(key) {
      Some(entry) => {
        entry.gc_epoch == epoch
          && entry.in_flight.is_none()
          && !state.subscriptions.is_observed(key)
      }
      None => false,
    };
    if idle {
      state.cache.remove(key);
      let hash = key.cache_hash();
      debug!(
        key = %key.description(),
        hash = &hash[..12],
        "evicted unobserved entry"
      );
    }
  }

  pub(crate) fn unsubscribe(self: &Arc<Self>, key: &K, id: SubscriberId) {
    let unobserved = {
      let mut state = self.state.lock();
      if state.disposed {
        return;
      }
      state.subscriptions.remove(key, id) == 0 && state.cache.get(key).is_some()
    };
    if unobserved {
      debug!(key = %key.description(), "last subscriber left");
      self.schedule_gc(key);
    }
  }
}

/// Explicit cache context shared by every consumer of server state.
///
/// Cloning is cheap and every clone sees the same cache. Create one at
/// startup and call [`QueryClient::dispose`] on shutdown.
pub struct QueryClient<K: QueryKey> {
  inner: Arc<ClientInner<K>>,
}

impl<K: QueryKey> QueryClient<K> {
  pub fn new(config: QueryClientConfig) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        state: Mutex::new(State {
          cache: ResourceCache::new(config.stale_time),
          subscriptions: SubscriptionRegistry::new(),
          next_fetch_id: 0,
          disposed: false,
        }),
        config,
      }),
    }
  }

  pub fn config(&self) -> &QueryClientConfig {
    &self.inner.config
  }

  /// Return fresh cached data for `key`, or fetch it.
  ///
  /// Concurrent calls for the same key share one fetch; `fetcher` is only
  /// invoked when a new fetch has to start.
  pub async fn query<F, Fut>(&self, key: K, fetcher: F, options: QueryOptions) -> Result<Value>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    self.query_with(key, query_fn(fetcher), options).await
  }

  /// Same as [`QueryClient::query`] with an already boxed query function.
  pub async fn query_with(&self, key: K, fetcher: QueryFn, options: QueryOptions) -> Result<Value> {
    match self.inner.lookup(&key, Some(fetcher), options, false)? {
      Lookup::Cached(data) => Ok(data),
      Lookup::Pending(fetch) => fetch.await,
    }
  }

  /// Start fetching `key` if it is stale, without waiting for the result.
  pub fn prefetch(&self, key: K, fetcher: QueryFn, options: QueryOptions) -> Result<()> {
    self.inner.lookup(&key, Some(fetcher), options, false)?;
    Ok(())
  }

  /// Fetch `key` again with its registered query function, ignoring
  /// freshness. Joins a fetch that is already in flight.
  pub async fn refetch(&self, key: &K) -> Result<Value> {
    match self.inner.lookup(key, None, QueryOptions::default(), true)? {
      Lookup::Cached(data) => Ok(data),
      Lookup::Pending(fetch) => fetch.await,
    }
  }

  /// Like [`QueryClient::refetch`] but does not wait for the result.
  pub fn refetch_detached(&self, key: &K) -> Result<()> {
    self.inner.lookup(key, None, QueryOptions::default(), true)?;
    Ok(())
  }

  /// Start a fetch of `key` regardless of freshness, registering `fetcher`
  /// for later refetches. Joins a fetch that is already in flight.
  pub fn refetch_with(&self, key: K, fetcher: QueryFn, options: QueryOptions) -> Result<()> {
    self.inner.lookup(&key, Some(fetcher), options, true)?;
    Ok(())
  }

  /// Mark every entry under `prefix` stale and refetch the observed ones.
  ///
  /// Returns the number of entries that matched.
  pub fn invalidate_queries(&self, prefix: &KeyPrefix) -> usize {
    let (matched, refetch) = {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      if state.disposed {
        return 0;
      }
      let matched = state.cache.invalidate(prefix);
      let refetch: Vec<K> = matched
        .iter()
        .filter(|key| state.subscriptions.is_observed(key))
        .cloned()
        .collect();
      (matched.len(), refetch)
    };
    debug!(prefix = %prefix, matched, observed = refetch.len(), "invalidated queries");

    if refetch.is_empty() {
      return matched;
    }
    if Handle::try_current().is_err() {
      debug!("no tokio runtime, refetch deferred to the next query");
      return matched;
    }
    for key in refetch {
      if let Err(err) = self.refetch_detached(&key) {
        debug!(key = %key.description(), error = %err, "skipping refetch");
      }
    }
    matched
  }

  /// Register `callback` for changes to `key`.
  ///
  /// The current snapshot is delivered immediately. The returned guard
  /// unsubscribes when dropped.
  pub fn subscribe<F>(&self, key: K, callback: F) -> Subscription<K>
  where
    F: Fn(&EntrySnapshot<K>) + Send + Sync + 'static,
  {
    let callback: Callback<K> = Arc::new(callback);
    let (id, snapshot) = {
      let mut guard = self.inner.state.lock();
      let state = &mut *guard;
      if state.disposed {
        return Subscription::inert(key);
      }
      let entry = state.cache.entry_mut(&key);
      // cancels a pending eviction
      entry.gc_epoch += 1;
      let snapshot = entry.snapshot(Instant::now());
      let id = state.subscriptions.add(key.clone(), Arc::clone(&callback));
      (id, snapshot)
    };
    callback(&snapshot);
    Subscription::new(Arc::downgrade(&self.inner), key, id)
  }

  /// Deliver the current snapshot of `key` to its subscribers.
  pub fn notify(&self, key: &K) {
    let notice = self.inner.state.lock().notice(key);
    if let Some(notice) = notice {
      notice.deliver();
    }
  }

  pub fn subscriber_count(&self, key: &K) -> usize {
    self.inner.state.lock().subscriptions.count(key)
  }

  pub fn get_query_data(&self, key: &K) -> Option<Value> {
    let state = self.inner.state.lock();
    state.cache.get(key).and_then(|entry| entry.data.clone())
  }

  /// Populate `key` by hand, as if a fetch had just returned `data`.
  pub fn set_query_data(&self, key: &K, data: Value) {
    let notice = {
      let mut state = self.inner.state.lock();
      if state.disposed {
        return;
      }
      state.cache.set(key, data);
      state.notice(key)
    };
    if let Some(notice) = notice {
      notice.deliver();
    }
  }

  pub fn snapshot(&self, key: &K) -> Option<EntrySnapshot<K>> {
    let state = self.inner.state.lock();
    state.cache.get(key).map(|entry| entry.snapshot(Instant::now()))
  }

  /// True when `key` is missing or would be refetched by the next query.
  pub fn is_stale(&self, key: &K) -> bool {
    let state = self.inner.state.lock();
    state
      .cache
      .get(key)
      .map(|entry| state.cache.is_stale(entry))
      .unwrap_or(true)
  }

  pub fn contains(&self, key: &K) -> bool {
    self.inner.state.lock().cache.get(key).is_some()
  }

  pub fn len(&self) -> usize {
    self.inner.state.lock().cache.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop the entry for `key`. A fetch in flight still completes but its
  /// result is discarded unless the key is queried again meanwhile.
  pub fn remove_query(&self, key: &K) -> bool {
    self.inner.state.lock().cache.remove(key).is_some()
  }

  /// Clear every entry and subscription. Further queries fail with
  /// [`Error::Disposed`].
  pub fn dispose(&self) {
    let mut state = self.inner.state.lock();
    state.disposed = true;
    state.cache.clear();
    state.subscriptions.clear();
    debug!("query client disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.state.lock().disposed
  }
}

impl<K: QueryKey> Clone for QueryClient<K> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<K: QueryKey> Default for QueryClient<K> {
  fn default() -> Self {
    Self::new(QueryClientConfig::default())
  }
}

impl<K: QueryKey> fmt::Debug for QueryClient<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("config", &self.inner.config)
      .field("entries", &self.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::tests::TestKey;
  use futures::future::BoxFuture;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  /// Query function returning the number of times it has been called.
  fn counter(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
      let calls = Arc::clone(&calls);
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !delay.is_zero() {
          tokio::time::sleep(delay).await;
        }
        Ok(json!(n))
      }
      .boxed()
    }
  }

  /// Query function that waits for `gate` before answering.
  fn gated(
    calls: &Arc<AtomicUsize>,
    gate: &Arc<Notify>,
  ) -> impl Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    let gate = Arc::clone(gate);
    move || {
      let calls = Arc::clone(&calls);
      let gate = Arc::clone(&gate);
      async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        gate.notified().await;
        Ok(json!(n))
      }
      .boxed()
    }
  }

  fn client() -> QueryClient<TestKey> {
    QueryClient::new(QueryClientConfig::default())
  }

  fn fresh_for(secs: u64) -> QueryOptions {
    QueryOptions::new().stale_time(Duration::from_secs(secs))
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_queries_share_one_fetch() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    let (a, b) = tokio::join!(
      client.query(
        TestKey::Todos,
        counter(&calls, Duration::from_millis(10)),
        QueryOptions::new()
      ),
      client.query(
        TestKey::Todos,
        counter(&calls, Duration::from_millis(10)),
        QueryOptions::new()
      ),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), json!(1));
    assert_eq!(b.unwrap(), json!(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_data_is_served_from_cache() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    client
      .query(TestKey::Todos, counter(&calls, Duration::ZERO), fresh_for(10))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_millis(9_999)).await;
    let cached = client
      .query(TestKey::Todos, counter(&calls, Duration::ZERO), fresh_for(10))
      .await
      .unwrap();
    assert_eq!(cached, json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    let refreshed = client
      .query(TestKey::Todos, counter(&calls, Duration::ZERO), fresh_for(10))
      .await
      .unwrap();
    assert_eq!(refreshed, json!(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_stale_time_always_refetches() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
      client
        .query(TestKey::Users, counter(&calls, Duration::ZERO), QueryOptions::new())
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_forces_refetch() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    client
      .query(TestKey::Todos, counter(&calls, Duration::ZERO), fresh_for(600))
      .await
      .unwrap();
    assert!(!client.is_stale(&TestKey::Todos));

    assert_eq!(client.invalidate_queries(&KeyPrefix::new(["todos"])), 1);
    assert!(client.is_stale(&TestKey::Todos));

    let value = client
      .query(TestKey::Todos, counter(&calls, Duration::ZERO), fresh_for(600))
      .await
      .unwrap();
    assert_eq!(value, json!(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_refetches_observed_entries() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    client
      .query(TestKey::Todo(1), counter(&calls, Duration::ZERO), fresh_for(600))
      .await
      .unwrap();
    client
      .query(TestKey::Users, counter(&calls, Duration::ZERO), fresh_for(600))
      .await
      .unwrap();
    let _sub = client.subscribe(TestKey::Todo(1), |_| {});

    client.invalidate_queries(&KeyPrefix::new(["todos"]));
    tokio::task::yield_now().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.get_query_data(&TestKey::Todo(1)), Some(json!(3)));
    assert!(!client.is_stale(&TestKey::Todo(1)));
    assert!(!client.is_stale(&TestKey::Users));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidation_during_flight_is_coalesced() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let _sub = client.subscribe(TestKey::Todos, |_| {});
    let pending = tokio::spawn({
      let client = client.clone();
      let fetcher = gated(&calls, &gate);
      async move { client.query(TestKey::Todos, fetcher, fresh_for(600)).await }
    });
    tokio::task::yield_now().await;
    assert!(client.snapshot(&TestKey::Todos).unwrap().is_fetching);

    client.invalidate_queries(&KeyPrefix::of(&TestKey::Todos));
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    assert_eq!(pending.await.unwrap().unwrap(), json!(1));

    // The result may predate the invalidating write, so it stays stale.
    assert!(client.is_stale(&TestKey::Todos));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refetch_keeps_previous_data() {
    let client = client();
    client
      .query(TestKey::Todos, || async { Ok::<_, Error>(json!(["kept"])) }, QueryOptions::new())
      .await
      .unwrap();

    let err = client
      .query(
        TestKey::Todos,
        || async { Err::<Value, _>(Error::Network("connection refused".to_string())) },
        QueryOptions::new(),
      )
      .await
      .unwrap_err();
    assert_eq!(err, Error::Network("connection refused".to_string()));

    let snapshot = client.snapshot(&TestKey::Todos).unwrap();
    assert_eq!(snapshot.status, QueryStatus::Error);
    assert_eq!(snapshot.data, Some(json!(["kept"])));
    assert_eq!(snapshot.error, Some(err));
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_does_not_poison_key() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client
      .query(
        TestKey::Users,
        || async { Err::<Value, _>(Error::Http { status: 500, message: "boom".to_string() }) },
        fresh_for(600),
      )
      .await;
    assert!(result.is_err());

    let value = client
      .query(TestKey::Users, counter(&calls, Duration::ZERO), fresh_for(600))
      .await
      .unwrap();
    assert_eq!(value, json!(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_attached_callers_share_the_error() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
      let calls = Arc::clone(&calls);
      move || {
        let calls = Arc::clone(&calls);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(5)).await;
          Err::<Value, _>(Error::Network("down".to_string()))
        }
      }
    };

    let (a, b) = tokio::join!(
      client.query(TestKey::Todos, fetcher.clone(), QueryOptions::new()),
      client.query(TestKey::Todos, fetcher, QueryOptions::new()),
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), b.unwrap_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_hook() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
      let calls = Arc::clone(&calls);
      move || {
        let calls = Arc::clone(&calls);
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::Network("flaky".to_string()))
          } else {
            Ok(json!("ok"))
          }
        }
      }
    };

    let value = client
      .query(TestKey::Todos, fetcher, QueryOptions::new().retry(1))
      .await
      .unwrap();
    assert_eq!(value, json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_subscribers_see_state_transitions() {
    let client = client();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = client.subscribe(TestKey::Todos, {
      let seen = Arc::clone(&seen);
      move |snapshot: &EntrySnapshot<TestKey>| seen.lock().push(snapshot.status)
    });

    client
      .query(TestKey::Todos, || async { Ok::<_, Error>(json!([])) }, QueryOptions::new())
      .await
      .unwrap();

    assert_eq!(
      *seen.lock(),
      vec![QueryStatus::Idle, QueryStatus::Loading, QueryStatus::Success]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_callbacks_can_read_the_client() {
    let client = client();
    let observed = Arc::new(Mutex::new(None));
    let _sub = client.subscribe(TestKey::Users, {
      let client = client.clone();
      let observed = Arc::clone(&observed);
      move |_: &EntrySnapshot<TestKey>| {
        *observed.lock() = client.get_query_data(&TestKey::Users);
      }
    });

    client.set_query_data(&TestKey::Users, json!(["ada"]));
    assert_eq!(*observed.lock(), Some(json!(["ada"])));
    client.dispose();
  }

  #[tokio::test(start_paused = true)]
  async fn test_unsubscribe_during_flight_keeps_result() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let sub = client.subscribe(TestKey::Todos, |_| {});
    let pending = tokio::spawn({
      let client = client.clone();
      let fetcher = gated(&calls, &gate);
      async move { client.query(TestKey::Todos, fetcher, QueryOptions::new()).await }
    });
    tokio::task::yield_now().await;

    sub.unsubscribe();
    assert_eq!(client.subscriber_count(&TestKey::Todos), 0);

    gate.notify_one();
    pending.await.unwrap().unwrap();
    assert_eq!(client.get_query_data(&TestKey::Todos), Some(json!(1)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_gc_waits_for_in_flight_fetch() {
    let client = QueryClient::new(QueryClientConfig {
      gc_time: Duration::ZERO,
      ..QueryClientConfig::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let sub = client.subscribe(TestKey::Todos, |_| {});
    client
      .prefetch(
        TestKey::Todos,
        Arc::new(gated(&calls, &gate)),
        QueryOptions::new(),
      )
      .unwrap();
    tokio::task::yield_now().await;

    drop(sub);
    assert!(client.contains(&TestKey::Todos));

    gate.notify_one();
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(!client.contains(&TestKey::Todos));
  }

  #[tokio::test(start_paused = true)]
  async fn test_gc_evicts_after_grace_period() {
    let client = QueryClient::new(QueryClientConfig {
      gc_time: Duration::from_secs(30),
      ..QueryClientConfig::default()
    });
    let sub = client.subscribe(TestKey::Users, |_| {});
    client.set_query_data(&TestKey::Users, json!([]));
    drop(sub);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(client.contains(&TestKey::Users));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!client.contains(&TestKey::Users));
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribe_cancels_eviction() {
    let client = QueryClient::new(QueryClientConfig {
      gc_time: Duration::from_secs(30),
      ..QueryClientConfig::default()
    });
    let sub = client.subscribe(TestKey::Users, |_| {});
    client.set_query_data(&TestKey::Users, json!([]));
    drop(sub);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let _again = client.subscribe(TestKey::Users, |_| {});

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(client.contains(&TestKey::Users));
  }

  #[tokio::test(start_paused = true)]
  async fn test_removed_entry_discards_late_result() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    client
      .prefetch(
        TestKey::Todos,
        Arc::new(gated(&calls, &gate)),
        QueryOptions::new(),
      )
      .unwrap();
    tokio::task::yield_now().await;

    assert!(client.remove_query(&TestKey::Todos));
    gate.notify_one();
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert!(!client.contains(&TestKey::Todos));
  }

  #[tokio::test(start_paused = true)]
  async fn test_recreated_entry_receives_late_result() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    client
      .prefetch(
        TestKey::Todos,
        Arc::new(gated(&calls, &gate)),
        QueryOptions::new(),
      )
      .unwrap();
    tokio::task::yield_now().await;

    client.remove_query(&TestKey::Todos);
    let _sub = client.subscribe(TestKey::Todos, |_| {});
    gate.notify_one();
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(client.get_query_data(&TestKey::Todos), Some(json!(1)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_requires_registered_query() {
    let client = client();
    let err = client.refetch(&TestKey::Todos).await.unwrap_err();
    assert!(matches!(err, Error::MalformedRequest(_)));
    assert!(!client.contains(&TestKey::Todos));
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_uses_registered_query() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .query(TestKey::Todos, counter(&calls, Duration::ZERO), fresh_for(600))
      .await
      .unwrap();

    assert_eq!(client.refetch(&TestKey::Todos).await.unwrap(), json!(2));
  }

  #[tokio::test(start_paused = true)]
  async fn test_refetch_detached_runs_in_background() {
    let client = client();
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .query(TestKey::Todos, counter(&calls, Duration::from_millis(10)), fresh_for(600))
      .await
      .unwrap();

    client.refetch_detached(&TestKey::Todos).unwrap();
    assert!(client.snapshot(&TestKey::Todos).unwrap().is_fetching);
    assert_eq!(client.get_query_data(&TestKey::Todos), Some(json!(1)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.get_query_data(&TestKey::Todos), Some(json!(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = client.refetch_detached(&TestKey::Users).unwrap_err();
    assert!(matches!(err, Error::MalformedRequest(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_dispose_clears_everything() {
    let client = client();
    let _sub = client.subscribe(TestKey::Todos, |_| {});
    client.set_query_data(&TestKey::Todos, json!([1]));

    client.dispose();
    assert!(client.is_disposed());
    assert!(client.is_empty());
    assert_eq!(client.subscriber_count(&TestKey::Todos), 0);

    let err = client
      .query(TestKey::Todos, || async { Ok::<_, Error>(json!([])) }, QueryOptions::new())
      .await
      .unwrap_err();
    assert_eq!(err, Error::Disposed);
  }
}
