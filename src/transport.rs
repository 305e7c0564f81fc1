//! Transport adapter: issues API requests and normalizes their outcome.

use color_eyre::{eyre::eyre, Result as EyreResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// Anything that can carry a JSON request to the record store.
pub trait Transport: Send + Sync {
  /// Send `body` (if any) with `method` to `path` and return the parsed
  /// response body.
  fn send<'a>(
    &'a self,
    method: Method,
    path: &'a str,
    body: Option<Value>,
  ) -> BoxFuture<'a, Result<Value>>;
}

/// HTTP transport backed by reqwest.
#[derive(Clone, Debug)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> EyreResult<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  pub fn from_config(config: &ApiConfig) -> EyreResult<Self> {
    Self::new(&config.base_url, Duration::from_secs(config.timeout_secs))
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| Error::MalformedRequest(format!("Invalid request path {}: {}", path, e)))?;

    let mut request = self
      .client
      .request(method.clone(), url)
      .header(ACCEPT, "application/json");
    if let Some(body) = body {
      request = request
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&body)?);
    }

    let response = request
      .send()
      .await
      .map_err(|e| Error::Network(format!("{} {} failed: {}", method, path, e)))?;
    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;
    debug!(%method, path, status = status.as_u16(), len = bytes.len(), "response received");

    if !status.is_success() {
      return Err(Error::Http {
        status: status.as_u16(),
        message: error_message(status, &bytes),
      });
    }

    serde_json::from_slice(&bytes)
      .map_err(|e| Error::Decode(format!("{} {} returned invalid JSON: {}", method, path, e)))
  }
}

impl Transport for HttpTransport {
  fn send<'a>(
    &'a self,
    method: Method,
    path: &'a str,
    body: Option<Value>,
  ) -> BoxFuture<'a, Result<Value>> {
    self.execute(method, path, body).boxed()
  }
}

/// Pick the server-provided message out of an error body.
///
/// The record store answers `{"error": ...}` for validation failures and
/// `{"message": ...}` for internal errors; anything else is returned as text.
fn error_message(status: StatusCode, body: &[u8]) -> String {
  if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
    for field in ["error", "message"] {
      if let Some(Value::String(message)) = map.get(field) {
        return message.clone();
      }
    }
  }

  let text = String::from_utf8_lossy(body).trim().to_string();
  if text.is_empty() {
    status
      .canonical_reason()
      .unwrap_or("request failed")
      .to_string()
  } else {
    text
  }
}
