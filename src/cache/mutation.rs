//! Mutations: one-shot writes that invalidate cached reads on success.

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::key::{KeyPrefix, QueryKey};
use super::layer::QueryClient;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Description of a side-effecting request.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  /// Prefixes to invalidate once the request succeeds
  pub invalidates: Vec<KeyPrefix>,
}

impl MutationRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      body: None,
      invalidates: Vec::new(),
    }
  }

  /// POST `body` serialized as JSON to `path`.
  pub fn post<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self> {
    let body = serde_json::to_value(body)
      .map_err(|e| Error::MalformedRequest(format!("Failed to serialize body: {}", e)))?;
    Ok(Self::new(Method::POST, path).with_body(body))
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn invalidates(mut self, prefix: KeyPrefix) -> Self {
    self.invalidates.push(prefix);
    self
  }

  /// Reject descriptors that can only come from a programming error.
  fn validate(&self) -> Result<()> {
    if !self.path.starts_with('/') {
      return Err(Error::MalformedRequest(format!(
        "mutation path must be absolute, got {:?}",
        self.path
      )));
    }
    if self.method == Method::GET || self.method == Method::HEAD {
      return Err(Error::MalformedRequest(format!(
        "{} is not a mutation method",
        self.method
      )));
    }
    Ok(())
  }
}

type SuccessCallback = Box<dyn FnOnce(&Value) + Send>;
type ErrorCallback = Box<dyn FnOnce(&Error) + Send>;

/// A request plus its lifecycle callbacks.
pub struct Mutation {
  request: MutationRequest,
  on_success: Option<SuccessCallback>,
  on_error: Option<ErrorCallback>,
}

impl Mutation {
  pub fn new(request: MutationRequest) -> Self {
    Self {
      request,
      on_success: None,
      on_error: None,
    }
  }

  /// Run after the request succeeded and the cache was invalidated.
  pub fn on_success<F>(mut self, callback: F) -> Self
  where
    F: FnOnce(&Value) + Send + 'static,
  {
    self.on_success = Some(Box::new(callback));
    self
  }

  /// Run when the request failed. The cache is left untouched.
  pub fn on_error<F>(mut self, callback: F) -> Self
  where
    F: FnOnce(&Error) + Send + 'static,
  {
    self.on_error = Some(Box::new(callback));
    self
  }

  pub fn request(&self) -> &MutationRequest {
    &self.request
  }
}

impl From<MutationRequest> for Mutation {
  fn from(request: MutationRequest) -> Self {
    Self::new(request)
  }
}

impl fmt::Debug for Mutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("request", &self.request)
      .field("on_success", &self.on_success.is_some())
      .field("on_error", &self.on_error.is_some())
      .finish()
  }
}

/// Executes mutations through a transport and invalidates the query cache.
///
/// Calls are never de-duplicated: two identical mutations produce two
/// requests.
pub struct MutationExecutor<K: QueryKey> {
  transport: Arc<dyn Transport>,
  client: QueryClient<K>,
}

impl<K: QueryKey> MutationExecutor<K> {
  pub fn new(transport: Arc<dyn Transport>, client: QueryClient<K>) -> Self {
    Self { transport, client }
  }

  pub async fn mutate(&self, mutation: impl Into<Mutation>) -> Result<Value> {
    let Mutation {
      request,
      on_success,
      on_error,
    } = mutation.into();
    request.validate()?;

    let outcome = self
      .transport
      .send(request.method.clone(), &request.path, request.body.clone())
      .await;

    match outcome {
      Ok(value) => {
        for prefix in &request.invalidates {
          let matched = self.client.invalidate_queries(prefix);
          debug!(path = %request.path, prefix = %prefix, matched, "mutation invalidated queries");
        }
        if let Some(callback) = on_success {
          callback(&value);
        }
        Ok(value)
      }
      Err(err) => {
        warn!(method = %request.method, path = %request.path, error = %err, "mutation failed");
        if let Some(callback) = on_error {
          callback(&err);
        }
        Err(err)
      }
    }
  }
}

impl<K: QueryKey> Clone for MutationExecutor<K> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      client: self.client.clone(),
    }
  }
}
