use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not found in environment variables")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Immutable proxy configuration, loaded once at startup and shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Backend credential.
    pub openai_api_key: String,
    /// Backend base location, e.g. `https://api.openai.com/v1`.
    pub openai_base_url: String,
    /// Set for Azure OpenAI deployments.
    pub azure_api_version: Option<String>,

    pub host: String,
    pub port: u16,
    pub log_level: String,

    /// Backend model used for "sonnet"/"opus" requests.
    pub big_model: String,
    /// Backend model used for "haiku" requests.
    pub small_model: String,

    pub max_tokens_limit: u32,
    pub min_tokens_limit: u32,
    /// Substituted when a request asks for fewer than `min_tokens_limit` tokens.
    pub default_max_tokens: u32,

    pub request_timeout: Duration,
    pub max_retries: u32,

    /// Estimate usage when the backend reports zero tokens.
    pub enable_token_estimation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            azure_api_version: None,
            host: "0.0.0.0".to_string(),
            port: 8082,
            log_level: "info".to_string(),
            big_model: "gpt-4o".to_string(),
            small_model: "gpt-4o-mini".to_string(),
            max_tokens_limit: 4096,
            min_tokens_limit: 100,
            default_max_tokens: 1024,
            request_timeout: Duration::from_secs(90),
            max_retries: 2,
            enable_token_estimation: true,
        }
    }
}

impl Config {
    /// Load configuration from process environment (after `.env` has been applied).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup; unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let openai_api_key = get("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        let azure_api_version = get("AZURE_API_VERSION");
        let mut openai_base_url = get("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url);
        if azure_api_version.is_some() {
            openai_base_url = azure_endpoint(&openai_base_url);
        }
        let openai_base_url = openai_base_url.trim_end_matches('/').to_string();

        Ok(Self {
            openai_api_key,
            openai_base_url,
            azure_api_version,
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port)?,
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            big_model: get("BIG_MODEL").unwrap_or(defaults.big_model),
            small_model: get("SMALL_MODEL").unwrap_or(defaults.small_model),
            max_tokens_limit: parse_or(&get, "MAX_TOKENS_LIMIT", defaults.max_tokens_limit)?,
            min_tokens_limit: parse_or(&get, "MIN_TOKENS_LIMIT", defaults.min_tokens_limit)?,
            default_max_tokens: parse_or(&get, "DEFAULT_MAX_TOKENS", defaults.default_max_tokens)?,
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "REQUEST_TIMEOUT",
                defaults.request_timeout.as_secs(),
            )?),
            max_retries: parse_or(&get, "MAX_RETRIES", defaults.max_retries)?,
            enable_token_estimation: match get("ENABLE_TOKEN_ESTIMATION") {
                Some(v) => parse_flag(&v).ok_or(ConfigError::Invalid {
                    key: "ENABLE_TOKEN_ESTIMATION",
                    value: v,
                })?,
                None => defaults.enable_token_estimation,
            },
        })
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Basic shape check for OpenAI keys; other backends use other formats.
    pub fn has_openai_style_key(&self) -> bool {
        self.openai_api_key.starts_with("sk-")
    }

    /// Log the effective configuration with the credential masked.
    pub fn summary(&self) {
        tracing::info!(
            base_url = %self.openai_base_url,
            azure_api_version = ?self.azure_api_version,
            big_model = %self.big_model,
            small_model = %self.small_model,
            max_tokens_limit = self.max_tokens_limit,
            min_tokens_limit = self.min_tokens_limit,
            default_max_tokens = self.default_max_tokens,
            request_timeout_secs = self.request_timeout.as_secs(),
            max_retries = self.max_retries,
            token_estimation = self.enable_token_estimation,
            api_key = %mask(&self.openai_api_key),
            "configuration loaded"
        );
        if !self.has_openai_style_key() && self.azure_api_version.is_none() {
            tracing::warn!("OPENAI_API_KEY does not look like an OpenAI key (expected sk- prefix)");
        }
    }
}

/// Reduce a full Azure deployment URL to its resource endpoint:
/// `https://x.openai.azure.com/openai/deployments/gpt-4/chat/completions` -> `https://x.openai.azure.com`
fn azure_endpoint(base: &str) -> String {
    match base.find("/openai") {
        Some(pos) => {
            let endpoint = &base[..pos];
            tracing::debug!(endpoint, "reduced Azure deployment URL to endpoint");
            endpoint.to_string()
        }
        None => base.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

/// Truthy/falsy parsing used for feature flags: 1,true,yes,on / 0,false,no,off
pub fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn mask(secret: &str) -> String {
    if secret.len() <= 8 {
        return "*".repeat(secret.len());
    }
    let head: String = secret.chars().take(4).collect();
    format!("{head}{}", "*".repeat(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let cfg = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(cfg.openai_base_url, "https://api.openai.com/v1");
        assert_eq!(cfg.big_model, "gpt-4o");
        assert_eq!(cfg.small_model, "gpt-4o-mini");
        assert_eq!(cfg.default_max_tokens, 1024);
        assert_eq!(cfg.request_timeout, Duration::from_secs(90));
        assert_eq!(cfg.max_retries, 2);
        assert!(cfg.enable_token_estimation);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8082");
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = Config::from_lookup(lookup(&[("BIG_MODEL", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPENAI_API_KEY")));
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let err = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("MAX_TOKENS_LIMIT", "lots"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { key: "MAX_TOKENS_LIMIT", ref value } if value == "lots")
        );
    }

    #[test]
    fn overrides_and_flags() {
        let cfg = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "http://localhost:11434/v1/"),
            ("BIG_MODEL", "llama3:70b"),
            ("SMALL_MODEL", "llama3:8b"),
            ("ENABLE_TOKEN_ESTIMATION", "off"),
            ("REQUEST_TIMEOUT", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.openai_base_url, "http://localhost:11434/v1");
        assert_eq!(cfg.big_model, "llama3:70b");
        assert!(!cfg.enable_token_estimation);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn azure_deployment_url_is_reduced_to_endpoint() {
        let cfg = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "abc123"),
            (
                "OPENAI_BASE_URL",
                "https://res.openai.azure.com/openai/deployments/gpt-4.1/chat/completions",
            ),
            ("AZURE_API_VERSION", "2024-06-01"),
        ]))
        .unwrap();
        assert_eq!(cfg.openai_base_url, "https://res.openai.azure.com");
        assert!(!cfg.has_openai_style_key());
    }

    #[test]
    fn mask_hides_most_of_the_key() {
        assert_eq!(mask("sk-abcdefghijkl"), "sk-a****************");
        assert_eq!(mask("short"), "*****");
    }
}
