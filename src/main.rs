use std::env;
use std::sync::Arc;

use anyhow::Context;
use messages2chat::config::Config;
use messages2chat::server::{build_router, AppState};
use messages2chat::upstream::OpenAiClient;
use messages2chat::util::{build_http_client, init_tracing};

fn print_usage(bin: &str) {
    let defaults = Config::default();
    println!("messages2chat {}", env!("CARGO_PKG_VERSION"));
    println!("Serve the Anthropic Messages API on top of an OpenAI Chat Completions backend.");
    println!();
    println!("Usage: {bin} [--help]");
    println!();
    println!("Configuration is read from the environment (and a .env file):");
    println!("  OPENAI_API_KEY        backend credential (required)");
    println!("  OPENAI_BASE_URL       backend base URL (default {})", defaults.openai_base_url);
    println!("  AZURE_API_VERSION     enable Azure OpenAI deployment routing");
    println!("  BIG_MODEL             model for sonnet/opus requests (default {})", defaults.big_model);
    println!("  SMALL_MODEL           model for haiku requests (default {})", defaults.small_model);
    println!("  MAX_TOKENS_LIMIT      upper bound for max_tokens (default {})", defaults.max_tokens_limit);
    println!("  MIN_TOKENS_LIMIT      smaller requests use DEFAULT_MAX_TOKENS (default {})", defaults.min_tokens_limit);
    println!("  DEFAULT_MAX_TOKENS    substitute for unset/too-small max_tokens (default {})", defaults.default_max_tokens);
    println!("  REQUEST_TIMEOUT       seconds (default {})", defaults.request_timeout.as_secs());
    println!("  MAX_RETRIES           retries on transient failures (default {})", defaults.max_retries);
    println!("  ENABLE_TOKEN_ESTIMATION  estimate usage when the backend reports none (default true)");
    println!("  HOST / PORT           listen address (default {}:{})", defaults.host, defaults.port);
    println!("  LOG_LEVEL             log filter when RUST_LOG is unset (default info)");
    println!();
    println!("Model mapping:");
    println!("  *haiku*          -> SMALL_MODEL");
    println!("  *sonnet*, *opus* -> BIG_MODEL");
    println!("  anything else    -> passed through unchanged");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().skip(1).any(|a| a == "--help" || a == "-h") {
        print_usage(&args[0]);
        return Ok(());
    }

    init_tracing();

    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };
    config.summary();

    let http = build_http_client(&config);
    let backend = Arc::new(OpenAiClient::new(http, config.clone()));
    let app = build_router(AppState::new(config.clone(), backend));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Messages2Chat listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
