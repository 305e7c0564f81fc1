//! Client-side synchronization layer for server state.
//!
//! This module provides a resource-agnostic query cache that:
//! - Caches fetched JSON values under typed keys
//! - De-duplicates concurrent fetches of the same key
//! - Serves stale data while a failed refetch is reported (stale-while-error)
//! - Invalidates entries by key prefix after mutations
//! - Notifies subscribers on every entry change and evicts unobserved entries

mod entry;
mod key;
mod layer;
mod mutation;
mod storage;
mod subscription;

pub use entry::{query_fn, CacheEntry, EntrySnapshot, QueryFn, QueryStatus};
pub use key::{KeyPrefix, QueryKey};
pub use layer::{QueryClient, QueryClientConfig, QueryOptions};
pub use mutation::{Mutation, MutationExecutor, MutationRequest};
pub use storage::ResourceCache;
pub use subscription::{Callback, SubscriberId, Subscription, SubscriptionRegistry};
