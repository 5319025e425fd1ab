use crate::config::Config;

/// Map a requested Messages API model id onto a configured backend model.
///
/// Case-insensitive marker test: "haiku" selects `small_model`, "sonnet" or "opus" selects
/// `big_model`, anything else is forwarded unchanged (so callers may name backend models
/// directly).
pub fn select_model(requested: &str, config: &Config) -> String {
    let lowered = requested.to_ascii_lowercase();
    if lowered.contains("haiku") {
        config.small_model.clone()
    } else if lowered.contains("sonnet") || lowered.contains("opus") {
        config.big_model.clone()
    } else {
        requested.to_string()
    }
}
