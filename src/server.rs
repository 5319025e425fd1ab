use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::conversion::{
    log_usage, to_chat_request, to_messages_response, transcode_stream, StreamTranscoder,
};
use crate::errors::ProxyError;
use crate::models::chat::ChatCompletionRequest;
use crate::models::messages::{MessagesRequest, StreamEvent, TokenCount};
use crate::tokens::estimate_request;
use crate::upstream::ChatBackend;
use crate::util::{cors_layer_from_env, sse_event};

/// Shared, read-only state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn ChatBackend>,
}

impl AppState {
    pub fn new(config: Arc<Config>, backend: Arc<dyn ChatBackend>) -> Self {
        Self { config, backend }
    }
}

/// Build the Axum router:
/// - `POST /v1/messages`
/// - `POST /v1/messages/count_tokens`
/// - `GET /health`
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(create_message))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/health", get(health))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer_from_env())
}

/// Service status: version, model mapping and feature flags.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = &state.config;
    Json(serde_json::json!({
        "status": "healthy",
        "name": "messages2chat",
        "version": env!("CARGO_PKG_VERSION"),
        "big_model": cfg.big_model,
        "small_model": cfg.small_model,
        "azure": cfg.azure_api_version.is_some(),
        "token_estimation": cfg.enable_token_estimation,
        "routes": ["/v1/messages", "/v1/messages/count_tokens", "/health"]
    }))
}

fn invalid_body(rejection: JsonRejection) -> ProxyError {
    ProxyError::InvalidRequest(rejection.body_text())
}

/// Estimated input tokens of a Messages request, without contacting the backend.
async fn count_tokens(
    payload: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Json<TokenCount>, ProxyError> {
    let Json(req) = payload.map_err(invalid_body)?;
    Ok(Json(TokenCount {
        input_tokens: estimate_request(&req),
    }))
}

/// Translate a Messages request, call the backend and translate the answer back.
/// - Non-streaming: one JSON response.
/// - Streaming: SSE events; failures before the stream opens use the HTTP status,
///   later ones become `error` events.
async fn create_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MessagesRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    let Json(req) = payload.map_err(invalid_body)?;
    let chat_req = to_chat_request(&req, &state.config);
    info!(
        requested_model = %req.model,
        backend_model = %chat_req.model,
        stream = req.is_stream(),
        messages = req.messages.len(),
        max_tokens = chat_req.max_tokens.unwrap_or_default(),
        "messages request"
    );

    if req.is_stream() {
        stream_message(&state, req, chat_req).await
    } else {
        let resp = state.backend.complete(&chat_req).await?;
        let backend_model = if resp.model.is_empty() {
            chat_req.model.clone()
        } else {
            resp.model.clone()
        };
        let out = to_messages_response(resp, &req, &state.config)?;
        log_usage(&req.model, &backend_model, out.usage, false);
        Ok(Json(out).into_response())
    }
}

async fn stream_message(
    state: &AppState,
    req: MessagesRequest,
    chat_req: ChatCompletionRequest,
) -> Result<Response, ProxyError> {
    let upstream = state.backend.stream(&chat_req).await?;

    let estimated_input = state
        .config
        .enable_token_estimation
        .then(|| estimate_request(&req));
    let transcoder = StreamTranscoder::new(req.model.clone(), estimated_input);

    let requested_model = req.model;
    let backend_model = chat_req.model;
    let events = transcode_stream(upstream, transcoder)
        .inspect(move |event| {
            if let StreamEvent::MessageDelta { usage, .. } = event {
                log_usage(&requested_model, &backend_model, *usage, true);
            }
        })
        .map(|event| sse_event(&event));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
