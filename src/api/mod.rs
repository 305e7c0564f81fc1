//! Hub resources: wire records, cache keys and the typed client.

mod client;
mod keys;
mod types;

pub use client::{simulated_reply, HubClient};
pub use keys::HubKey;
pub use types::{
  ChatMessage, DiscussionPost, NewChatMessage, NewDiscussionPost, NewQuizResponse, QuizResponse,
  Validate,
};
