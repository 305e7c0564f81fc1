//! In-memory, append-only record tables.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::api::{
  ChatMessage, DiscussionPost, NewChatMessage, NewDiscussionPost, NewQuizResponse, QuizResponse,
};

/// Records of one kind, with ids handed out from 1.
#[derive(Debug)]
struct Table<T> {
  records: Vec<T>,
  next_id: u64,
}

impl<T: Clone> Table<T> {
  fn new() -> Self {
    Self {
      records: Vec::new(),
      next_id: 1,
    }
  }

  fn insert(&mut self, build: impl FnOnce(u64, DateTime<Utc>) -> T) -> T {
    let id = self.next_id;
    self.next_id += 1;
    let record = build(id, Utc::now());
    self.records.push(record.clone());
    record
  }

  /// All records in insertion order
  fn all(&self) -> Vec<T> {
    self.records.clone()
  }
}

/// Storage backing the record store. Each table has its own lock.
#[derive(Debug)]
pub struct MemStorage {
  quiz: Mutex<Table<QuizResponse>>,
  chat: Mutex<Table<ChatMessage>>,
  discussion: Mutex<Table<DiscussionPost>>,
}

impl MemStorage {
  pub fn new() -> Self {
    Self {
      quiz: Mutex::new(Table::new()),
      chat: Mutex::new(Table::new()),
      discussion: Mutex::new(Table::new()),
    }
  }

  pub fn add_quiz_response(&self, response: NewQuizResponse) -> QuizResponse {
    self.quiz.lock().insert(|id, timestamp| QuizResponse {
      id,
      question: response.question,
      answer: response.answer,
      is_correct: response.is_correct,
      timestamp,
    })
  }

  pub fn quiz_responses(&self) -> Vec<QuizResponse> {
    self.quiz.lock().all()
  }

  pub fn add_chat_message(&self, message: NewChatMessage) -> ChatMessage {
    self.chat.lock().insert(|id, timestamp| ChatMessage {
      id,
      message: message.message,
      is_user: message.is_user,
      category: message.category,
      context: message.context,
      timestamp,
    })
  }

  pub fn chat_history(&self) -> Vec<ChatMessage> {
    self.chat.lock().all()
  }

  pub fn add_discussion_post(&self, post: NewDiscussionPost) -> DiscussionPost {
    self.discussion.lock().insert(|id, timestamp| DiscussionPost {
      id,
      content: post.content,
      author: post.author,
      timestamp,
    })
  }

  pub fn discussion_posts(&self) -> Vec<DiscussionPost> {
    self.discussion.lock().all()
  }
}

impl Default for MemStorage {
  fn default() -> Self {
    Self::new()
  }
}
