//! Translation between the Messages API (caller side) and Chat Completions (backend side).
//!
//! - `request`: caller request -> backend request (model selection, content blocks, tools,
//!   token limits).
//! - `response`: one complete backend response -> caller response.
//! - `stream`: incremental backend chunks -> caller stream events.
//!
//! Every function here is pure apart from `tracing` diagnostics; local translation faults
//! (unknown blocks, malformed tool arguments) degrade the output instead of failing it.

pub mod request;
pub mod response;
pub mod stream;

pub use request::to_chat_request;
pub use response::to_messages_response;
pub use stream::{transcode_stream, StreamTranscoder};

use crate::models::messages::{StopReason, Usage};

/// Map a backend finish reason onto the Messages API stop reason.
///
/// Reasons outside the known table (provider-specific filters and the like) map to `end_turn`.
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

/// Usage line emitted once per completed exchange.
pub fn log_usage(requested_model: &str, backend_model: &str, usage: Usage, stream: bool) {
    tracing::info!(
        requested_model,
        backend_model,
        stream,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.input_tokens.saturating_add(usage.output_tokens),
        "token usage"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_table() {
        assert_eq!(map_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("length"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("tool_calls"), StopReason::ToolUse);
        assert_eq!(map_finish_reason("function_call"), StopReason::ToolUse);
        assert_eq!(map_finish_reason("content_filter"), StopReason::StopSequence);
        assert_eq!(map_finish_reason("safety"), StopReason::EndTurn);
        assert_eq!(map_finish_reason(""), StopReason::EndTurn);
    }

    #[test]
    fn generated_ids_have_prefixes() {
        assert!(new_message_id().starts_with("msg_"));
        let id = new_tool_use_id();
        assert!(id.starts_with("toolu_"));
        assert_ne!(id, new_tool_use_id());
    }
}
