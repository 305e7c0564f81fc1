//! HTTP routes of the record store.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, enabled, error, info, Level};

use super::storage::MemStorage;
use crate::api::{
  ChatMessage, DiscussionPost, NewChatMessage, NewDiscussionPost, NewQuizResponse, QuizResponse,
};
use crate::resources::Resource;

type AppState = Arc<MemStorage>;

/// Build the record store router.
pub fn router(storage: Arc<MemStorage>) -> Router {
  Router::new()
    .route(Resource::Quiz.path(), get(list_quiz).post(create_quiz))
    .route(Resource::Chat.path(), get(list_chat).post(create_chat))
    .route(
      Resource::Discussion.path(),
      get(list_discussion).post(create_discussion),
    )
    .fallback(not_found)
    .layer(middleware::from_fn(log_requests))
    .with_state(storage)
}

/// Failure reported to a client of the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
  /// The POST body did not match the insert shape of `Resource`
  InvalidData(Resource),
  NotFound,
  Internal(String),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    match self {
      ApiError::InvalidData(resource) => (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": resource.invalid_data_message() })),
      )
        .into_response(),
      ApiError::NotFound => (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": "Not Found" })),
      )
        .into_response(),
      ApiError::Internal(message) => (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": message })),
      )
        .into_response(),
    }
  }
}

fn parse<T: DeserializeOwned>(resource: Resource, body: &[u8]) -> Result<T, ApiError> {
  serde_json::from_slice(body).map_err(|e| {
    debug!(%resource, error = %e, "rejected request body");
    ApiError::InvalidData(resource)
  })
}

async fn list_quiz(State(storage): State<AppState>) -> Json<Vec<QuizResponse>> {
  Json(storage.quiz_responses())
}

async fn create_quiz(
  State(storage): State<AppState>,
  body: Bytes,
) -> Result<Json<QuizResponse>, ApiError> {
  let response: NewQuizResponse = parse(Resource::Quiz, &body)?;
  Ok(Json(storage.add_quiz_response(response)))
}

async fn list_chat(State(storage): State<AppState>) -> Json<Vec<ChatMessage>> {
  Json(storage.chat_history())
}

async fn create_chat(
  State(storage): State<AppState>,
  body: Bytes,
) -> Result<Json<ChatMessage>, ApiError> {
  let message: NewChatMessage = parse(Resource::Chat, &body)?;
  Ok(Json(storage.add_chat_message(message)))
}

async fn list_discussion(State(storage): State<AppState>) -> Json<Vec<DiscussionPost>> {
  Json(storage.discussion_posts())
}

async fn create_discussion(
  State(storage): State<AppState>,
  body: Bytes,
) -> Result<Json<DiscussionPost>, ApiError> {
  let post: NewDiscussionPost = parse(Resource::Discussion, &body)?;
  Ok(Json(storage.add_discussion_post(post)))
}

async fn not_found() -> ApiError {
  ApiError::NotFound
}

/// Log every API request as `METHOD path status in Nms` and turn handler
/// panics into a 500. At debug level the JSON response body is appended
/// after ` :: `.
async fn log_requests(request: Request, next: Next) -> Response {
  let start = Instant::now();
  let method = request.method().clone();
  let path = request.uri().path().to_string();

  let response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
    Ok(response) => response,
    Err(_) => {
      error!(%method, %path, "request handler panicked");
      ApiError::Internal("Internal Server Error".to_string()).into_response()
    }
  };

  if !path.starts_with("/api") {
    return response;
  }

  let status = response.status().as_u16();
  let elapsed = start.elapsed().as_millis();
  if !(enabled!(Level::DEBUG) && is_json(&response)) {
    info!("{}", log_line(method.as_str(), &path, status, elapsed, None));
    return response;
  }

  let (parts, body) = response.into_parts();
  match axum::body::to_bytes(body, usize::MAX).await {
    Ok(bytes) => {
      info!("{}", log_line(method.as_str(), &path, status, elapsed, Some(&bytes[..])));
      Response::from_parts(parts, Body::from(bytes))
    }
    Err(e) => {
      error!(%method, %path, error = %e, "failed to buffer response body");
      ApiError::Internal("Internal Server Error".to_string()).into_response()
    }
  }
}

fn is_json(response: &Response) -> bool {
  response
    .headers()
    .get(header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .is_some_and(|value| value.starts_with("application/json"))
}

fn log_line(
  method: &str,
  path: &str,
  status: u16,
  elapsed_ms: u128,
  body: Option<&[u8]>,
) -> String {
  let mut line = format!("{} {} {} in {}ms", method, path, status, elapsed_ms);
  if let Some(body) = body.filter(|body| !body.is_empty()) {
    line.push_str(" :: ");
    line.push_str(&String::from_utf8_lossy(body));
  }
  line
}
