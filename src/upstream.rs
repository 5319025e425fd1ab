//! Backend client: one Chat Completions POST per request, with retry and timeouts.
//!
//! Retries only happen before any response bytes reach the caller: a non-streaming call is
//! retried as a whole, a streaming call only while connecting. Once fragments flow, a failure
//! ends the stream with a classified error instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::stream::{self, Stream, StreamExt};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::ProxyError;
use crate::models::chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

/// Incremental backend fragments; ends after `[DONE]` or with one classified error.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk, ProxyError>> + Send>>;

/// Transport seam between the HTTP handlers and the backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Non-streaming call: one complete backend response.
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProxyError>;

    /// Streaming call. Errors returned here happen before any fragment was received.
    async fn stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream, ProxyError>;
}

/// Retry and timeout policy for backend calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Bound for one non-streaming attempt, for awaiting stream headers, and for each gap
    /// between stream fragments.
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(90),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retries.saturating_add(1),
            timeout: config.request_timeout,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`: exponential from `base_delay`, up to half again as
    /// jitter, never above `max_delay`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = (exp.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        (exp + jitter).min(self.max_delay)
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ProxyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upstream attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Chat Completions client for OpenAI, Azure OpenAI and compatible servers.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: Arc<Config>,
    policy: RetryPolicy,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client, config: Arc<Config>) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            http,
            config,
            policy,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `{base}/chat/completions`, or the Azure deployment route when an API version is set.
    pub fn completions_url(&self, model: &str) -> String {
        let base = self.config.openai_base_url.trim_end_matches('/');
        match &self.config.azure_api_version {
            Some(version) => format!(
                "{base}/openai/deployments/{model}/chat/completions?api-version={version}"
            ),
            None => format!("{base}/chat/completions"),
        }
    }

    /// POST the request and check the status; the body is left unread.
    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProxyError> {
        let url = self.completions_url(&request.model);
        let mut builder = self.http.post(&url).json(request);
        builder = if self.config.azure_api_version.is_some() {
            builder.header("api-key", &self.config.openai_api_key)
        } else {
            builder.bearer_auth(&self.config.openai_api_key)
        };
        if request.is_stream() {
            builder = builder.header(http::header::ACCEPT, "text/event-stream");
        }

        debug!(url = %url, model = %request.model, stream = request.is_stream(), "sending upstream request");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, model = %request.model, "upstream returned error");
            return Err(ProxyError::from_upstream(status, &body));
        }
        Ok(response)
    }

    fn timed_out(&self) -> ProxyError {
        ProxyError::UpstreamTimeout(format!(
            "upstream did not respond within {}s",
            self.policy.timeout.as_secs()
        ))
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProxyError> {
        self.policy
            .retry("complete", move || async move {
                let attempt = async {
                    let response = self.send(request).await?;
                    let bytes = response.bytes().await?;
                    let value: Value = serde_json::from_slice(&bytes)?;
                    if value.get("error").is_some() {
                        return Err(ProxyError::from_error_payload(&value));
                    }
                    Ok(serde_json::from_value::<ChatCompletionResponse>(value)?)
                };
                tokio::time::timeout(self.policy.timeout, attempt)
                    .await
                    .map_err(|_| self.timed_out())?
            })
            .await
    }

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream, ProxyError> {
        let response = self
            .policy
            .retry("stream", move || async move {
                tokio::time::timeout(self.policy.timeout, self.send(request))
                    .await
                    .map_err(|_| self.timed_out())?
            })
            .await?;

        let events = Box::pin(response.bytes_stream().eventsource());
        Ok(chunk_stream(events, self.policy.timeout))
    }
}

/// Decoded payload of one upstream SSE event.
#[derive(Debug)]
pub enum Frame {
    Chunk(ChatCompletionChunk),
    Done,
    Failed(ProxyError),
    /// Empty or unparseable; skipped.
    Skip,
}

pub fn decode_frame(data: &str) -> Frame {
    let data = data.trim();
    if data.is_empty() {
        return Frame::Skip;
    }
    if data == "[DONE]" {
        return Frame::Done;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, data, "skipping unparseable upstream chunk");
            return Frame::Skip;
        }
    };
    if value.get("error").is_some() {
        return Frame::Failed(ProxyError::from_error_payload(&value));
    }
    match serde_json::from_value::<ChatCompletionChunk>(value) {
        Ok(chunk) => Frame::Chunk(chunk),
        Err(e) => {
            warn!(error = %e, data, "skipping upstream chunk of unexpected shape");
            Frame::Skip
        }
    }
}

/// Turn decoded SSE events into chunks, bounding every gap between events by `idle`.
pub fn chunk_stream<S, E>(events: S, idle: Duration) -> ChunkStream
where
    S: Stream<Item = Result<eventsource_stream::Event, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    Box::pin(stream::unfold(Some(events), move |state| async move {
        let mut events = state?;
        loop {
            let next = match tokio::time::timeout(idle, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let err = ProxyError::UpstreamTimeout(format!(
                        "no data from upstream for {}s",
                        idle.as_secs()
                    ));
                    return Some((Err(err), None));
                }
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    let err = ProxyError::UpstreamUnavailable(format!("upstream stream failed: {e}"));
                    return Some((Err(err), None));
                }
                None => return None,
            };
            match decode_frame(&event.data) {
                Frame::Chunk(chunk) => return Some((Ok(chunk), Some(events))),
                Frame::Failed(err) => return Some((Err(err), None)),
                Frame::Done => return None,
                Frame::Skip => continue,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sse(body: &'static str) -> ChunkStream {
        let bytes = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            body.as_bytes(),
        ))]);
        chunk_stream(Box::pin(bytes.eventsource()), Duration::from_secs(5))
    }

    #[test]
    fn policy_from_config() {
        let config = Config {
            max_retries: 4,
            request_timeout: Duration::from_secs(7),
            ..Config::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.timeout, Duration::from_secs(7));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..10 {
            let exp = policy
                .base_delay
                .saturating_mul(2u32.pow(attempt - 1))
                .min(policy.max_delay);
            let d = policy.delay_with(attempt, &mut rng);
            assert!(d >= exp, "attempt {attempt}: {d:?} < {exp:?}");
            assert!(d <= policy.max_delay);
        }
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let result: Result<(), _> = policy
            .retry("test", || {
                calls += 1;
                async { Err(ProxyError::Authentication("bad key".into())) }
            })
            .await;
        assert!(matches!(result, Err(ProxyError::Authentication(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts_on_retryable() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let result: Result<u8, _> = policy
            .retry("test", || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err(ProxyError::UpstreamUnavailable("503".into()))
                    } else {
                        Ok(9)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 9);
        assert_eq!(calls, 3);
    }

    #[test]
    fn azure_and_openai_urls() {
        let openai = OpenAiClient::new(reqwest::Client::new(), Arc::new(Config::default()));
        assert_eq!(
            openai.completions_url("gpt-4o"),
            "https://api.openai.com/v1/chat/completions"
        );

        let azure = OpenAiClient::new(
            reqwest::Client::new(),
            Arc::new(Config {
                openai_base_url: "https://res.openai.azure.com".into(),
                azure_api_version: Some("2024-06-01".into()),
                ..Config::default()
            }),
        );
        assert_eq!(
            azure.completions_url("gpt-4o"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn frame_decoding() {
        assert!(matches!(decode_frame("[DONE]"), Frame::Done));
        assert!(matches!(decode_frame(" "), Frame::Skip));
        assert!(matches!(decode_frame("{not json"), Frame::Skip));
        assert!(matches!(
            decode_frame(r#"{"choices":[{"delta":{"content":"x"}}]}"#),
            Frame::Chunk(_)
        ));
        assert!(matches!(
            decode_frame(r#"{"error":{"message":"quota","code":"insufficient_quota"}}"#),
            Frame::Failed(ProxyError::RateLimit(_))
        ));
    }

    #[tokio::test]
    async fn sse_stream_stops_at_done_and_skips_garbage() {
        let chunks: Vec<_> = sse(concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: oops\n\n",
            ": keep-alive comment\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after\"}}]}\n\n",
        ))
        .collect()
        .await;
        let texts: Vec<String> = chunks
            .into_iter()
            .map(|c| c.unwrap().choices[0].delta.content.clone().unwrap())
            .collect();
        assert_eq!(texts, ["a", "b"]);
    }

    #[tokio::test]
    async fn sse_error_payload_ends_stream() {
        let items: Vec<_> = sse(concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n",
        ))
        .collect()
        .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ProxyError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn idle_gap_times_out() {
        let pending = stream::pending::<Result<eventsource_stream::Event, std::io::Error>>();
        let mut s = chunk_stream(pending, Duration::from_millis(20));
        let first = s.next().await;
        assert!(matches!(first, Some(Err(ProxyError::UpstreamTimeout(_)))));
        assert!(s.next().await.is_none());
    }
}
