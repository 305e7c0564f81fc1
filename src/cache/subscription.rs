//! Subscription registry: who observes which key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use super::entry::EntrySnapshot;
use super::key::QueryKey;
use super::layer::ClientInner;

/// Callback invoked with the entry snapshot whenever the entry changes.
pub type Callback<K> = Arc<dyn Fn(&EntrySnapshot<K>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Subscribers per key.
///
/// Only bookkeeping lives here; the registry never touches cache entries.
pub struct SubscriptionRegistry<K> {
  subscribers: HashMap<K, Vec<(SubscriberId, Callback<K>)>>,
  next_id: u64,
}

impl<K: QueryKey> SubscriptionRegistry<K> {
  pub fn new() -> Self {
    Self {
      subscribers: HashMap::new(),
      next_id: 0,
    }
  }

  pub fn add(&mut self, key: K, callback: Callback<K>) -> SubscriberId {
    let id = SubscriberId(self.next_id);
    self.next_id += 1;
    self.subscribers.entry(key).or_default().push((id, callback));
    id
  }

  /// Remove a subscriber and return how many remain for `key`.
  pub fn remove(&mut self, key: &K, id: SubscriberId) -> usize {
    let remaining = match self.subscribers.get_mut(key) {
      Some(list) => {
        list.retain(|(sid, _)| *sid != id);
        list.len()
      }
      None => return 0,
    };
    if remaining == 0 {
      self.subscribers.remove(key);
    }
    remaining
  }

  pub fn count(&self, key: &K) -> usize {
    self.subscribers.get(key).map(Vec::len).unwrap_or(0)
  }

  pub fn is_observed(&self, key: &K) -> bool {
    self.count(key) > 0
  }

  /// Clone the callbacks for `key` so they can run outside the state lock.
  pub fn callbacks(&self, key: &K) -> Vec<Callback<K>> {
    self
      .subscribers
      .get(key)
      .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
      .unwrap_or_default()
  }

  pub fn observed_keys(&self) -> impl Iterator<Item = &K> {
    self.subscribers.keys()
  }

  pub fn clear(&mut self) {
    self.subscribers.clear();
  }
}

impl<K: QueryKey> Default for SubscriptionRegistry<K> {
  fn default() -> Self {
    Self::new()
  }
}

/// Guard returned by [`QueryClient::subscribe`](super::QueryClient::subscribe).
///
/// Dropping the guard unsubscribes.
pub struct Subscription<K: QueryKey> {
  inner: Option<Weak<ClientInner<K>>>,
  key: K,
  id: SubscriberId,
}

impl<K: QueryKey> Subscription<K> {
  pub(crate) fn new(inner: Weak<ClientInner<K>>, key: K, id: SubscriberId) -> Self {
    Self {
      inner: Some(inner),
      key,
      id,
    }
  }

  /// Subscription that is not registered anywhere (client already disposed).
  pub(crate) fn inert(key: K) -> Self {
    Self {
      inner: None,
      key,
      id: SubscriberId(u64::MAX),
    }
  }

  pub fn key(&self) -> &K {
    &self.key
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if let Some(inner) = self.inner.take().and_then(|weak| weak.upgrade()) {
      inner.unsubscribe(&self.key, self.id);
    }
  }
}

impl<K: QueryKey> Drop for Subscription<K> {
  fn drop(&mut self) {
    self.release();
  }
}

impl<K: QueryKey> fmt::Debug for Subscription<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("id", &self.id)
      .field("active", &self.inner.is_some())
      .finish()
  }
}
