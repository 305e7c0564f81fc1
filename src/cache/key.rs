//! Cache keys and key prefixes.

use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::Hash;

/// Trait for typed cache keys.
///
/// Keys are compared structurally (derive `Eq` + `Hash` on the implementing
/// type). `segments` renders the key as an ordered list of path-like segments,
/// which is what prefix invalidation matches against.
pub trait QueryKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
  /// Ordered segments identifying the resource (e.g. `["discussion", "7"]`).
  fn segments(&self) -> Vec<String>;

  /// Human readable description for logs.
  fn description(&self) -> String {
    format!("{:?}", self.segments())
  }

  /// Stable fingerprint of the key.
  fn cache_hash(&self) -> String {
    // SHA256 over the unit-separated segments
    let mut hasher = Sha256::new();
    hasher.update(self.segments().join("\u{1f}").as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A leading run of key segments.
///
/// A key matches a prefix when the prefix's segments are, segment by segment,
/// the first segments of the key. The empty prefix matches every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
  segments: Vec<String>,
}

impl KeyPrefix {
  pub fn new<I, S>(segments: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      segments: segments.into_iter().map(Into::into).collect(),
    }
  }

  /// Prefix that matches every key.
  pub fn all() -> Self {
    Self {
      segments: Vec::new(),
    }
  }

  /// Prefix made of all segments of `key`.
  pub fn of<K: QueryKey>(key: &K) -> Self {
    Self {
      segments: key.segments(),
    }
  }

  pub fn segments(&self) -> &[String] {
    &self.segments
  }

  pub fn matches<K: QueryKey>(&self, key: &K) -> bool {
    let key_segments = key.segments();
    key_segments.len() >= self.segments.len()
      && self
        .segments
        .iter()
        .zip(key_segments.iter())
        .all(|(prefix, segment)| prefix == segment)
  }
}

impl fmt::Display for KeyPrefix {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self.segments)
  }
}
