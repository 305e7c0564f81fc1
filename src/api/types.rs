//! Records exchanged with the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Client-side checks run before a record is sent.
pub trait Validate {
  fn validate(&self) -> Result<()>;
}

fn require(field: &str, value: &str) -> Result<()> {
  if value.trim().is_empty() {
    return Err(Error::Validation(format!("{} must not be empty", field)));
  }
  Ok(())
}

/// A stored quiz answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResponse {
  pub id: u64,
  pub question: String,
  pub answer: String,
  pub is_correct: bool,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuizResponse {
  pub question: String,
  pub answer: String,
  pub is_correct: bool,
}

impl Validate for NewQuizResponse {
  fn validate(&self) -> Result<()> {
    require("question", &self.question)?;
    require("answer", &self.answer)
  }
}

/// A stored chat message, from the user or the simulated assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
  pub id: u64,
  pub message: String,
  pub is_user: bool,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub context: Option<String>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatMessage {
  pub message: String,
  pub is_user: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub context: Option<String>,
}

impl NewChatMessage {
  pub fn user(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      is_user: true,
      category: None,
      context: None,
    }
  }

  pub fn assistant(message: impl Into<String>) -> Self {
    Self {
      is_user: false,
      ..Self::user(message)
    }
  }
}

impl Validate for NewChatMessage {
  fn validate(&self) -> Result<()> {
    require("message", &self.message)
  }
}

/// A stored discussion board post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionPost {
  pub id: u64,
  pub content: String,
  pub author: String,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDiscussionPost {
  pub content: String,
  pub author: String,
}

impl Validate for NewDiscussionPost {
  fn validate(&self) -> Result<()> {
    require("content", &self.content)?;
    require("author", &self.author)
  }
}

impl fmt::Display for QuizResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let verdict = if self.is_correct { "correct" } else { "wrong" };
    write!(
      f,
      "#{} [{}] {} -> {} ({})",
      self.id,
      self.timestamp.format("%Y-%m-%d %H:%M:%S"),
      self.question,
      self.answer,
      verdict
    )
  }
}

impl fmt::Display for ChatMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let speaker = if self.is_user { "you" } else { "assistant" };
    write!(
      f,
      "#{} [{}] {}: {}",
      self.id,
      self.timestamp.format("%H:%M:%S"),
      speaker,
      self.message
    )
  }
}

impl fmt::Display for DiscussionPost {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "#{} [{}] {}: {}",
      self.id,
      self.timestamp.format("%Y-%m-%d %H:%M"),
      self.author,
      self.content
    )
  }
}
