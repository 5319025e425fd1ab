use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{parse_flag, Config};
use crate::models::messages::StreamEvent;

/// Load the environment file and initialize structured tracing.
///
/// - ENV_FILE / DOTENV_PATH name an explicit env file; otherwise `.env` is discovered from
///   the working directory upward. Existing process variables are never overwritten.
/// - Filter: RUST_LOG, else LOG_LEVEL (e.g. "debug"), else "info".
///
/// Returns where the environment was loaded from.
pub fn init_tracing() -> String {
    let mut env_source = "none".to_string();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" {
        if let Ok(path) = dotenvy::dotenv() {
            env_source = path.display().to_string();
        }
    }

    let filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|lvl| lvl.trim().to_ascii_lowercase())
                .filter(|lvl| !lvl.is_empty())
                .map(|lvl| format!("{lvl},tower_http={lvl}"))
        })
        .unwrap_or_else(|| "info,tower_http=info".into());
    let subscriber = fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
    env_source
}

/// Build the backend HTTP client.
///
/// Environment:
/// - MESSAGES2CHAT_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - MESSAGES2CHAT_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY                -> picked up by reqwest itself
///
/// Per-request deadlines are enforced by the retry policy, so only connecting is bounded here.
pub fn build_http_client(config: &Config) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.request_timeout.min(Duration::from_secs(30)))
        .user_agent(format!("messages2chat/{}", env!("CARGO_PKG_VERSION")));

    let no_proxy = std::env::var("MESSAGES2CHAT_NO_PROXY")
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(false);

    if no_proxy {
        builder = builder.no_proxy();
    } else if let Ok(url) = std::env::var("MESSAGES2CHAT_PROXY_URL") {
        let u = url.trim();
        if !u.is_empty() {
            match reqwest::Proxy::all(u) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!(error = %e, "ignoring invalid MESSAGES2CHAT_PROXY_URL"),
            }
        }
    }

    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default HTTP client");
        reqwest::Client::new()
    })
}

/// Frame one Messages API event as a named SSE event.
pub fn sse_event(event: &StreamEvent) -> Result<Event, Infallible> {
    let sse = Event::default().event(event.name());
    Ok(sse.json_data(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, event = event.name(), "failed to serialize stream event");
        Event::default().event(event.name()).data("{}")
    }))
}

/// Build a CORS layer from environment variables.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins (e.g., "https://a.com, https://b.com")
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_MAX_AGE: max age in seconds (u64)
///
/// Defaults are permissive (Any). Methods are limited to what the router serves.
pub fn cors_layer_from_env() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};

    let mut layer = CorsLayer::new().allow_methods([http::Method::GET, http::Method::POST]);

    let origins: Vec<http::HeaderValue> = csv_env("CORS_ALLOWED_ORIGINS")
        .iter()
        .filter_map(|p| http::HeaderValue::from_str(p).ok())
        .collect();
    layer = if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    };

    let headers: Vec<http::HeaderName> = csv_env("CORS_ALLOWED_HEADERS")
        .iter()
        .filter_map(|p| http::HeaderName::try_from(p.as_str()).ok())
        .collect();
    layer = if headers.is_empty() {
        layer.allow_headers(Any)
    } else {
        layer.allow_headers(AllowHeaders::list(headers))
    };

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            layer = layer.max_age(Duration::from_secs(n));
        }
    }

    layer
}

/// Comma-separated values of `key`; "*" and unset both mean "no explicit list".
fn csv_env(key: &str) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if v.trim() != "*" => v
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

