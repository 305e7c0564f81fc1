//! Typed client for the hub's record store, backed by the query cache.

use futures::FutureExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::cache::{
  KeyPrefix, MutationExecutor, MutationRequest, QueryClient, QueryClientConfig, QueryFn,
  QueryOptions,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::resources::Resource;
use crate::transport::{HttpTransport, Transport};

use super::keys::HubKey;
use super::types::{
  ChatMessage, DiscussionPost, NewChatMessage, NewDiscussionPost, NewQuizResponse, QuizResponse,
  Validate,
};

/// Hub client with transparent caching support.
///
/// Reads go through the shared [`QueryClient`], so concurrent readers of a
/// collection share one request. Writes go through the [`MutationExecutor`]
/// and invalidate the collection they touched.
#[derive(Clone)]
pub struct HubClient {
  transport: Arc<dyn Transport>,
  queries: QueryClient<HubKey>,
  mutations: MutationExecutor<HubKey>,
}

impl HubClient {
  /// Create a client talking HTTP to the configured record store.
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    let transport = HttpTransport::from_config(&config.api)?;
    Ok(Self::with_transport(
      Arc::new(transport),
      config.cache.query_client_config(),
    ))
  }

  pub fn with_transport(transport: Arc<dyn Transport>, config: QueryClientConfig) -> Self {
    let queries = QueryClient::new(config);
    let mutations = MutationExecutor::new(Arc::clone(&transport), queries.clone());
    Self {
      transport,
      queries,
      mutations,
    }
  }

  /// The underlying query cache.
  pub fn queries(&self) -> &QueryClient<HubKey> {
    &self.queries
  }

  /// Query function that fetches `key` from the record store.
  pub fn query_fn(&self, key: &HubKey) -> QueryFn {
    let transport = Arc::clone(&self.transport);
    let key = key.clone();
    Arc::new(move || {
      let transport = Arc::clone(&transport);
      let key = key.clone();
      async move {
        let list = transport
          .send(Method::GET, key.resource().path(), None)
          .await?;
        match key {
          HubKey::DiscussionPost { id } => find_by_id(list, id),
          _ => Ok(list),
        }
      }
      .boxed()
    })
  }

  async fn read<T: DeserializeOwned>(&self, key: HubKey) -> Result<T> {
    let fetcher = self.query_fn(&key);
    let value = self
      .queries
      .query_with(key, fetcher, QueryOptions::new())
      .await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Validate `body`, POST it to `resource` and invalidate the resource's keys.
  async fn create<B, T>(&self, resource: Resource, body: &B) -> Result<T>
  where
    B: Serialize + Validate,
    T: DeserializeOwned,
  {
    body.validate()?;
    let request = MutationRequest::post(resource.path(), body)?
      .invalidates(KeyPrefix::of(&HubKey::list(resource)));
    let value = self.mutations.mutate(request).await?;
    Ok(serde_json::from_value(value)?)
  }

  pub async fn quiz_responses(&self) -> Result<Vec<QuizResponse>> {
    self.read(HubKey::Quiz).await
  }

  pub async fn chat_history(&self) -> Result<Vec<ChatMessage>> {
    self.read(HubKey::Chat).await
  }

  pub async fn discussion_posts(&self) -> Result<Vec<DiscussionPost>> {
    self.read(HubKey::Discussion).await
  }

  pub async fn discussion_post(&self, id: u64) -> Result<DiscussionPost> {
    self.read(HubKey::DiscussionPost { id }).await
  }

  pub async fn submit_quiz(&self, response: &NewQuizResponse) -> Result<QuizResponse> {
    self.create(Resource::Quiz, response).await
  }

  pub async fn post_chat(&self, message: &NewChatMessage) -> Result<ChatMessage> {
    self.create(Resource::Chat, message).await
  }

  /// Post a user message followed by the simulated assistant reply.
  pub async fn send_chat(&self, text: &str) -> Result<(ChatMessage, ChatMessage)> {
    let sent = self.post_chat(&NewChatMessage::user(text)).await?;
    let reply = self
      .post_chat(&NewChatMessage::assistant(simulated_reply(text)))
      .await?;
    info!(user = sent.id, assistant = reply.id, "chat exchange stored");
    Ok((sent, reply))
  }

  pub async fn post_discussion(&self, post: &NewDiscussionPost) -> Result<DiscussionPost> {
    self.create(Resource::Discussion, post).await
  }

  /// Observe `key`, decoding its data into `T`.
  pub fn observe<T>(&self, key: HubKey) -> Query<HubKey, T>
  where
    T: DeserializeOwned + Clone,
  {
    let fetcher = self.query_fn(&key);
    Query::new(&self.queries, key, fetcher)
  }

  /// Drop every cached entry and subscription.
  pub fn dispose(&self) {
    self.queries.dispose();
  }
}

impl std::fmt::Debug for HubClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HubClient")
      .field("queries", &self.queries)
      .finish_non_exhaustive()
  }
}

/// Pick the record with `id` out of a collection.
fn find_by_id(list: Value, id: u64) -> Result<Value> {
  let Value::Array(records) = list else {
    return Err(Error::Decode("expected a list of records".to_string()));
  };
  records
    .into_iter()
    .find(|record| record.get("id").and_then(Value::as_u64) == Some(id))
    .ok_or_else(|| Error::Http {
      status: 404,
      message: format!("record {} not found", id),
    })
}

/// Canned assistant answer for the chat simulator.
pub fn simulated_reply(input: &str) -> &'static str {
  match input.to_lowercase().as_str() {
    "hello" => "Hi! How can I assist you today?",
    "what can you do" => {
      "I can help with various tasks like writing, analysis, coding, and answering questions."
    }
    _ => "I understand. Could you please provide more details about what you'd like to know?",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query::QueryState;
  use crate::transport::tests::MockTransport;
  use serde_json::json;
  use std::time::Duration;

  fn post(id: u64, content: &str) -> Value {
    json!({
      "id": id,
      "content": content,
      "author": "ada",
      "timestamp": "2024-05-01T10:00:00.000Z"
    })
  }

  fn setup(config: QueryClientConfig) -> (Arc<MockTransport>, HubClient) {
    let transport = Arc::new(MockTransport::new());
    let client = HubClient::with_transport(transport.clone(), config);
    (transport, client)
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_share_one_request() {
    let (transport, client) = setup(QueryClientConfig::default());
    transport.respond(Method::GET, "/api/discussion", Ok(json!([post(1, "hi")])));

    let (a, b) = tokio::join!(client.discussion_posts(), client.discussion_posts());
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_post_invalidates_collection() {
    let (transport, client) = setup(QueryClientConfig {
      stale_time: Duration::from_secs(600),
      ..QueryClientConfig::default()
    });
    transport.respond(Method::GET, "/api/discussion", Ok(json!([post(1, "hi")])));
    transport.respond(Method::POST, "/api/discussion", Ok(post(2, "second")));

    client.discussion_posts().await.unwrap();
    client.discussion_post(1).await.unwrap();
    assert!(!client.queries().is_stale(&HubKey::Discussion));

    let created = client
      .post_discussion(&NewDiscussionPost {
        content: "second".to_string(),
        author: "ada".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(created.id, 2);

    assert!(client.queries().is_stale(&HubKey::Discussion));
    assert!(client
      .queries()
      .is_stale(&HubKey::DiscussionPost { id: 1 }));

    let requests = transport.requests();
    let (method, path, body) = requests.last().unwrap();
    assert_eq!(method, &Method::POST);
    assert_eq!(path, "/api/discussion");
    assert_eq!(
      body.as_ref().unwrap(),
      &json!({"content": "second", "author": "ada"})
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_validation_never_reaches_transport() {
    let (transport, client) = setup(QueryClientConfig::default());

    let err = client
      .post_discussion(&NewDiscussionPost {
        content: " ".to_string(),
        author: "ada".to_string(),
      })
      .await
      .unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_rejection_is_reported() {
    let (transport, client) = setup(QueryClientConfig::default());
    transport.respond(
      Method::POST,
      "/api/quiz",
      Err(Error::Http {
        status: 400,
        message: "Invalid quiz response data".to_string(),
      }),
    );

    let err = client
      .submit_quiz(&NewQuizResponse {
        question: "Q".to_string(),
        answer: "A".to_string(),
        is_correct: false,
      })
      .await
      .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(err.status(), Some(400));
  }

  #[tokio::test(start_paused = true)]
  async fn test_discussion_post_lookup() {
    let (transport, client) = setup(QueryClientConfig::default());
    transport.respond(
      Method::GET,
      "/api/discussion",
      Ok(json!([post(1, "first"), post(2, "second")])),
    );

    assert_eq!(client.discussion_post(2).await.unwrap().content, "second");
    let missing = client.discussion_post(9).await.unwrap_err();
    assert_eq!(missing.status(), Some(404));
  }

  #[tokio::test(start_paused = true)]
  async fn test_send_chat_posts_reply() {
    let (transport, client) = setup(QueryClientConfig::default());
    transport.respond(
      Method::POST,
      "/api/chat",
      Ok(json!({
        "id": 1,
        "message": "hello",
        "isUser": true,
        "timestamp": "2024-05-01T10:00:00.000Z"
      })),
    );

    client.send_chat("Hello").await.unwrap();

    let bodies: Vec<Value> = transport
      .requests()
      .into_iter()
      .filter_map(|(_, _, body)| body)
      .collect();
    assert_eq!(
      bodies,
      vec![
        json!({"message": "Hello", "isUser": true}),
        json!({"message": "Hi! How can I assist you today?", "isUser": false}),
      ]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_observe_decodes_records() {
    let (transport, client) = setup(QueryClientConfig::default());
    transport.respond(Method::GET, "/api/discussion", Ok(json!([post(1, "hi")])));

    let mut query = client.observe::<Vec<DiscussionPost>>(HubKey::Discussion);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    query.poll();

    match query.state() {
      QueryState::Success(posts) => assert_eq!(posts[0].content, "hi"),
      other => panic!("unexpected state {:?}", other),
    }
  }

  #[test]
  fn test_simulated_replies() {
    assert_eq!(simulated_reply("hello"), "Hi! How can I assist you today?");
    assert_eq!(
      simulated_reply("What can you do"),
      "I can help with various tasks like writing, analysis, coding, and answering questions."
    );
    assert!(simulated_reply("tell me a joke").starts_with("I understand."));
    assert!(simulated_reply("hello ").starts_with("I understand."));
  }
}
