//! Query keys for hub resources.

use crate::cache::{KeyPrefix, QueryKey};
use crate::resources::Resource;

/// Query key types for hub API calls.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HubKey {
  /// All submitted quiz answers
  Quiz,
  /// The chat history
  Chat,
  /// All discussion posts
  Discussion,
  /// A single discussion post, served out of the discussion list
  DiscussionPost { id: u64 },
}

impl HubKey {
  /// Key of the whole collection for `resource`.
  pub fn list(resource: Resource) -> Self {
    match resource {
      Resource::Quiz => Self::Quiz,
      Resource::Chat => Self::Chat,
      Resource::Discussion => Self::Discussion,
    }
  }

  pub fn resource(&self) -> Resource {
    match self {
      Self::Quiz => Resource::Quiz,
      Self::Chat => Resource::Chat,
      Self::Discussion | Self::DiscussionPost { .. } => Resource::Discussion,
    }
  }

  /// Prefix covering every key of this key's resource.
  pub fn resource_prefix(&self) -> KeyPrefix {
    KeyPrefix::of(&Self::list(self.resource()))
  }
}

impl QueryKey for HubKey {
  fn segments(&self) -> Vec<String> {
    match self {
      Self::DiscussionPost { id } => vec!["discussion".to_string(), id.to_string()],
      other => vec![other.resource().name().to_string()],
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Quiz => "quiz answers".to_string(),
      Self::Chat => "chat history".to_string(),
      Self::Discussion => "discussion posts".to_string(),
      Self::DiscussionPost { id } => format!("discussion post {}", id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_segments() {
    assert_eq!(HubKey::Quiz.segments(), vec!["quiz"]);
    assert_eq!(
      HubKey::DiscussionPost { id: 7 }.segments(),
      vec!["discussion", "7"]
    );
  }

  #[test]
  fn test_discussion_prefix_covers_single_posts() {
    let prefix = HubKey::Discussion.resource_prefix();
    assert!(prefix.matches(&HubKey::DiscussionPost { id: 3 }));
    assert!(prefix.matches(&HubKey::Discussion));
    assert!(!prefix.matches(&HubKey::Quiz));
    assert_eq!(HubKey::DiscussionPost { id: 3 }.resource_prefix(), prefix);
  }

  #[test]
  fn test_hash_is_stable_and_distinct() {
    assert_eq!(HubKey::Chat.cache_hash(), HubKey::Chat.cache_hash());
    assert_ne!(
      HubKey::DiscussionPost { id: 1 }.cache_hash(),
      HubKey::DiscussionPost { id: 2 }.cache_hash()
    );
    assert_eq!(HubKey::Chat.cache_hash().len(), 64);
  }
}
