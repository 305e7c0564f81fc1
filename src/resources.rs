//! Hub resources and name resolution for the command line.

use std::fmt;
use std::str::FromStr;

/// A record collection served by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
  Quiz,
  Chat,
  Discussion,
}

impl Resource {
  pub fn name(self) -> &'static str {
    self.info().name
  }

  /// Collection path on the record store
  pub fn path(self) -> &'static str {
    match self {
      Resource::Quiz => "/api/quiz",
      Resource::Chat => "/api/chat",
      Resource::Discussion => "/api/discussion",
    }
  }

  /// Message returned by the record store when a POST body fails validation
  pub fn invalid_data_message(self) -> &'static str {
    match self {
      Resource::Quiz => "Invalid quiz response data",
      Resource::Chat => "Invalid chat message data",
      Resource::Discussion => "Invalid discussion post data",
    }
  }

  pub fn info(self) -> &'static ResourceInfo {
    RESOURCES
      .iter()
      .find(|info| info.resource == self)
      .unwrap_or(&RESOURCES[0])
  }
}

impl fmt::Display for Resource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Resource {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    resolve(s).ok_or_else(|| {
      let choices: Vec<String> = RESOURCES
        .iter()
        .map(|info| format!("{} ({})", info.name, info.description))
        .collect();
      format!("unknown resource {:?}, expected one of {}", s, choices.join(", "))
    })
  }
}

#[derive(Debug, Clone)]
pub struct ResourceInfo {
  pub resource: Resource,
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All available resources
pub const RESOURCES: &[ResourceInfo] = &[
  ResourceInfo {
    resource: Resource::Quiz,
    name: "quiz",
    aliases: &["q", "quizzes", "answers"],
    description: "Submitted quiz answers",
  },
  ResourceInfo {
    resource: Resource::Chat,
    name: "chat",
    aliases: &["c", "messages", "history"],
    description: "Chat simulator history",
  },
  ResourceInfo {
    resource: Resource::Discussion,
    name: "discussion",
    aliases: &["d", "posts", "board"],
    description: "Discussion board posts",
  },
];

/// Get resource suggestions for a given input, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static ResourceInfo> {
  let input_lower = input.trim().to_lowercase();

  if input_lower.is_empty() {
    return RESOURCES.iter().collect();
  }

  let mut matches: Vec<(&ResourceInfo, u32)> = Vec::new();

  for info in RESOURCES {
    if info.name == input_lower {
      matches.push((info, 0));
      continue;
    }

    if info.aliases.contains(&input_lower.as_str()) {
      matches.push((info, 1));
      continue;
    }

    if info.name.starts_with(&input_lower) {
      matches.push((info, 2));
      continue;
    }

    if info.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((info, 3));
      continue;
    }

    if info.name.contains(&input_lower) {
      matches.push((info, 4));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(info, _)| info).collect()
}

/// Resolve user input to a resource when the best match is unambiguous.
pub fn resolve(input: &str) -> Option<Resource> {
  let suggestions = get_suggestions(input);
  match suggestions.as_slice() {
    [] => None,
    [only] => Some(only.resource),
    [first, second, ..] => {
      let exact = |info: &ResourceInfo| {
        let input = input.trim().to_lowercase();
        info.name == input || info.aliases.contains(&input.as_str())
      };
      if exact(first) && !exact(second) {
        Some(first.resource)
      } else {
        None
      }
    }
  }
}
