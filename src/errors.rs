use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::models::messages::{ErrorBody, StreamEvent};

/// Failures surfaced to Messages API callers.
///
/// Each variant is one member of the fixed taxonomy; the payload is the caller-facing
/// message (already enriched with operator guidance where a known cause was detected).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Backend rejected the credential (401/403).
    #[error("{0}")]
    Authentication(String),

    /// Backend throttled the request or the account ran out of quota.
    #[error("{0}")]
    RateLimit(String),

    /// Caller request (or its translation) was rejected as invalid.
    #[error("{0}")]
    InvalidRequest(String),

    /// REQUEST_TIMEOUT elapsed before the backend answered.
    #[error("{0}")]
    UpstreamTimeout(String),

    /// Backend unreachable or failing with 5xx.
    #[error("{0}")]
    UpstreamUnavailable(String),

    /// Backend answered with a payload of unexpected shape.
    #[error("{0}")]
    Protocol(String),

    /// Unclassified failure inside the proxy.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Protocol(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Messages API error `type` string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication_error",
            Self::RateLimit(_) => "rate_limit_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::UpstreamTimeout(_) => "timeout_error",
            Self::UpstreamUnavailable(_) | Self::Protocol(_) | Self::Internal(_) => "api_error",
        }
    }

    /// Whether the upstream call may be attempted again.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::UpstreamUnavailable(_) | Self::RateLimit(_)
        )
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Authentication(m)
            | Self::RateLimit(m)
            | Self::InvalidRequest(m)
            | Self::UpstreamTimeout(m)
            | Self::UpstreamUnavailable(m)
            | Self::Protocol(m)
            | Self::Internal(m) => m,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.error_type().to_string(),
            message: self.message().to_string(),
        }
    }

    /// `{"type":"error","error":{"type":..,"message":..}}`
    pub fn envelope(&self) -> Value {
        serde_json::json!({
            "type": "error",
            "error": self.body(),
        })
    }

    /// The same information as an in-stream `error` event.
    pub fn to_event(&self) -> StreamEvent {
        StreamEvent::Error { error: self.body() }
    }

    /// Classify a non-success backend response from its status and raw body.
    pub fn from_upstream(status: StatusCode, body: &str) -> Self {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| error_message(&v))
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("upstream error").to_string()
                } else {
                    body.trim().to_string()
                }
            });
        let message = guidance(&detail, Some(status));

        match status.as_u16() {
            401 | 403 => Self::Authentication(message),
            429 => Self::RateLimit(message),
            408 | 504 => Self::UpstreamTimeout(message),
            500..=599 => Self::UpstreamUnavailable(message),
            _ => Self::InvalidRequest(message),
        }
    }

    /// Classify an `{"error": {...}}` payload received without an HTTP status (mid-stream).
    pub fn from_error_payload(payload: &Value) -> Self {
        let err = payload.get("error").unwrap_or(payload);
        let tag = |key: &str| {
            err.get(key)
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase)
                .unwrap_or_default()
        };
        let (kind, code) = (tag("type"), tag("code"));
        let detail = error_message(payload).unwrap_or_else(|| payload.to_string());
        let message = guidance(&detail, None);

        let is = |needle: &str| kind.contains(needle) || code.contains(needle);
        if is("invalid_api_key") || is("authentication") {
            Self::Authentication(message)
        } else if is("rate_limit") || is("insufficient_quota") {
            Self::RateLimit(message)
        } else if is("invalid_request") {
            Self::InvalidRequest(message)
        } else if is("timeout") {
            Self::UpstreamTimeout(message)
        } else {
            Self::UpstreamUnavailable(message)
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::UpstreamTimeout(format!("upstream request timed out: {e}"))
        } else if e.is_decode() {
            Self::Protocol(format!("invalid upstream payload: {e}"))
        } else {
            Self::UpstreamUnavailable(format!("upstream request failed: {e}"))
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid upstream payload: {e}"))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::warn!(status = %self.status_code(), error_type = self.error_type(), error = %self, "request failed");
        (self.status_code(), axum::Json(self.envelope())).into_response()
    }
}

/// `error.message` (or a bare string `error`) from a backend error body.
fn error_message(v: &Value) -> Option<String> {
    match v.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        None => v.get("message").and_then(Value::as_str).map(str::to_string),
    }
}

/// Replace well-known backend failures with an actionable message for the operator.
/// Unrecognized details pass through unchanged.
pub fn guidance(detail: &str, status: Option<StatusCode>) -> String {
    let lower = detail.to_ascii_lowercase();

    let hint = if lower.contains("resource not found") && status == Some(StatusCode::NOT_FOUND) {
        Some("Azure OpenAI resource not found. Check the deployment name, endpoint URL and API version.")
    } else if lower.contains("unsupported_country_region_territory")
        || lower.contains("country, region, or territory not supported")
    {
        Some("OpenAI API is not available in your region. Consider Azure OpenAI or another compatible backend.")
    } else if lower.contains("invalid_api_key")
        || lower.contains("incorrect api key")
        || lower.contains("unauthorized")
    {
        Some("Invalid API key. Check your OPENAI_API_KEY configuration.")
    } else if lower.contains("rate_limit") || lower.contains("rate limit") || lower.contains("quota") {
        Some("Rate limit exceeded. Wait and try again, or upgrade your API plan.")
    } else if lower.contains("model")
        && (lower.contains("not found") || lower.contains("does not exist"))
    {
        Some("Model not found. Check your BIG_MODEL and SMALL_MODEL configuration.")
    } else if lower.contains("billing") || lower.contains("payment") {
        Some("Billing issue. Check your OpenAI account billing status.")
    } else if lower.contains("azure") && lower.contains("endpoint") {
        Some("Azure OpenAI endpoint configuration issue. Verify OPENAI_BASE_URL and AZURE_API_VERSION.")
    } else {
        None
    };

    match hint {
        Some(h) => format!("{h} ({detail})"),
        None => detail.to_string(),
    }
}
