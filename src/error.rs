//! Error taxonomy shared by the cache, the transport and the hub client.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the data synchronization layer.
///
/// The type is `Clone` because a single fetch outcome is handed to every
/// caller attached to the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  /// The request body failed client-side checks and was never sent.
  #[error("validation failed: {0}")]
  Validation(String),

  /// The server answered with a non-success status.
  #[error("request failed with status {status}: {message}")]
  Http { status: u16, message: String },

  /// The request never produced a response (connection refused, timeout, ...).
  #[error("network error: {0}")]
  Network(String),

  /// The response body could not be parsed into the expected shape.
  #[error("malformed response: {0}")]
  Decode(String),

  /// The caller built an invalid request descriptor. This is a bug, not a
  /// runtime condition.
  #[error("malformed request: {0}")]
  MalformedRequest(String),

  /// The query client was disposed.
  #[error("query client has been disposed")]
  Disposed,
}

impl Error {
  /// True for client-side validation failures and for server 400 responses.
  pub fn is_validation(&self) -> bool {
    matches!(
      self,
      Error::Validation(_) | Error::Http { status: 400, .. }
    )
  }

  /// HTTP status code carried by the error, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      Error::Http { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Error::Decode(err.to_string())
  }
}
