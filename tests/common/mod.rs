#![allow(dead_code)]

//! Shared helpers for proxy integration tests.
//!
//! `MockBackend` is a scripted OpenAI-compatible server on an ephemeral port that records
//! every request body it receives. `TestServer` runs the real proxy router, configured to
//! talk to that mock, on another ephemeral port.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use messages2chat::config::Config;
use messages2chat::server::{build_router, AppState};
use messages2chat::upstream::{OpenAiClient, RetryPolicy};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Canned backend behavior.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Status + JSON body.
    Json(u16, Value),
    /// `text/event-stream` body made of these `data:` payloads, in order.
    Sse(Vec<String>),
}

struct MockState {
    reply: MockReply,
    requests: Mutex<Vec<Value>>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    join: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(reply: MockReply) -> Self {
        let state = Arc::new(MockState {
            reply,
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat_completions))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock addr");
        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { addr, state, join }
    }

    /// Includes `/v1`; the client appends `/chat/completions`.
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// Request bodies received so far.
    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().expect("requests lock").clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.join.abort();
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> Response {
    state.requests.lock().expect("requests lock").push(body);
    match &state.reply {
        MockReply::Json(status, value) => (
            StatusCode::from_u16(*status).expect("valid status"),
            Json(value.clone()),
        )
            .into_response(),
        MockReply::Sse(payloads) => {
            let body: String = payloads
                .iter()
                .map(|p| format!("data: {p}\n\n"))
                .collect();
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }
    }
}

/// A text chunk as an OpenAI-compatible backend streams it.
pub fn text_chunk(text: &str) -> String {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000u64,
        "model": "gpt-4o",
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    })
    .to_string()
}

pub fn finish_chunk(reason: &str) -> String {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000u64,
        "model": "gpt-4o",
        "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
    })
    .to_string()
}

pub fn usage_chunk(prompt: u64, completion: u64) -> String {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "choices": [],
        "usage": {"prompt_tokens": prompt, "completion_tokens": completion,
                  "total_tokens": prompt + completion}
    })
    .to_string()
}

/// A complete non-streaming backend response.
pub fn completion(content: &str, finish_reason: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000u64,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }],
        "usage": {"prompt_tokens": 11, "completion_tokens": 5, "total_tokens": 16}
    })
}

/// Configuration pointing at `base_url` with test model names.
pub fn test_config(base_url: String) -> Config {
    Config {
        openai_api_key: "sk-test".into(),
        openai_base_url: base_url,
        big_model: "gpt-big".into(),
        small_model: "gpt-small".into(),
        request_timeout: Duration::from_secs(5),
        max_retries: 0,
        ..Config::default()
    }
}

pub struct TestServer {
    pub base_url: String,
    join: JoinHandle<()>,
    client: reqwest::Client,
}

impl TestServer {
    /// Spawn the proxy router with `config` on an ephemeral port.
    pub async fn spawn(config: Config) -> Self {
        let config = Arc::new(config);
        let backend = OpenAiClient::new(reqwest::Client::new(), config.clone()).with_policy(
            RetryPolicy {
                base_delay: Duration::ZERO,
                ..RetryPolicy::from_config(&config)
            },
        );
        let app = build_router(AppState::new(config, Arc::new(backend)));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        let join = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {e:?}");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            join,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed building reqwest client"),
        }
    }

    /// Spawn a mock backend answering with `reply` and a proxy in front of it.
    pub async fn with_mock(reply: MockReply) -> (Self, MockBackend) {
        let mock = MockBackend::start(reply).await;
        let server = Self::spawn(test_config(mock.base_url())).await;
        (server, mock)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .expect("request sent")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .expect("request sent")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Parse an SSE body into `(event name, data JSON)` pairs, skipping comments.
pub fn parse_sse(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut name = None;
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data.push_str(v.trim_start());
                }
            }
            let name = name?;
            let value = serde_json::from_str(&data).expect("event data is JSON");
            Some((name, value))
        })
        .collect()
}
