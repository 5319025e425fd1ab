use serde_json::Value;
use tracing::warn;

use super::{map_finish_reason, new_message_id, new_tool_use_id};
use crate::config::Config;
use crate::errors::ProxyError;
use crate::models::chat::{ChatCompletionResponse, FunctionCall};
use crate::models::messages::{
    MessagesRequest, MessagesResponse, ResponseBlock, StopReason, Usage,
};
use crate::tokens::{estimate_request, TextTally};

/// Build the caller response from a complete backend response.
///
/// `original` is the caller request; its model id is echoed back and, when the backend
/// reports no usage, it is the basis of the input-token estimate.
pub fn to_messages_response(
    resp: ChatCompletionResponse,
    original: &MessagesRequest,
    config: &Config,
) -> Result<MessagesResponse, ProxyError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::Protocol("upstream response contained no choices".into()))?;
    let message = choice.message;

    let mut content = Vec::new();
    let mut output = TextTally::new();

    if let Some(text) = message.content.filter(|t| !t.is_empty()) {
        output.push(&text);
        content.push(ResponseBlock::Text { text });
    }

    for call in message.tool_calls.unwrap_or_default() {
        output.push(&call.function.name);
        output.push(&call.function.arguments);
        let id = if call.id.is_empty() {
            new_tool_use_id()
        } else {
            call.id
        };
        content.push(tool_use_block(id, call.function));
    }

    // Legacy single function call
    if let Some(function) = message.function_call {
        output.push(&function.name);
        output.push(&function.arguments);
        content.push(tool_use_block(new_tool_use_id(), function));
    }

    if content.is_empty() {
        content.push(ResponseBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = choice
        .finish_reason
        .as_deref()
        .map(map_finish_reason)
        .unwrap_or(StopReason::EndTurn);

    let reported = resp.usage.unwrap_or_default();
    let mut usage = Usage {
        input_tokens: saturate(reported.prompt_tokens),
        output_tokens: saturate(reported.completion_tokens),
    };
    if usage.input_tokens == 0 && usage.output_tokens == 0 && config.enable_token_estimation {
        usage = Usage {
            input_tokens: estimate_request(original),
            output_tokens: output.tokens(),
        };
        tracing::debug!(?usage, "backend reported no usage; estimated");
    }

    let id = if resp.id.is_empty() {
        new_message_id()
    } else {
        resp.id
    };

    let mut out = MessagesResponse::skeleton(id, original.model.clone());
    out.content = content;
    out.stop_reason = Some(stop_reason);
    out.usage = usage;
    Ok(out)
}

/// Parse the argument text of a completed call. Unparseable text is kept under
/// `raw_arguments` so the caller still sees what the model produced.
pub fn parse_tool_arguments(name: &str, arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = %name, error = %e, "malformed tool arguments; keeping raw text");
            serde_json::json!({ "raw_arguments": arguments })
        }
    }
}

fn tool_use_block(id: String, function: FunctionCall) -> ResponseBlock {
    let input = parse_tool_arguments(&function.name, &function.arguments);
    ResponseBlock::ToolUse {
        id,
        name: function.name,
        input,
    }
}

fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "What's the weather in Paris?"}]
        }))
        .unwrap()
    }

    fn backend(v: Value) -> ChatCompletionResponse {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn text_response_with_usage() {
        let resp = backend(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Sunny."},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }));
        let out = to_messages_response(resp, &request(), &Config::default()).unwrap();
        assert_eq!(out.id, "chatcmpl-1");
        assert_eq!(out.model, "claude-3-5-sonnet-20241022");
        assert_eq!(out.content, vec![ResponseBlock::Text { text: "Sunny.".into() }]);
        assert_eq!(out.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(out.usage, Usage { input_tokens: 12, output_tokens: 3 });
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let resp = backend(json!({
            "choices": [{"message": {
                "content": "Let me look.",
                "tool_calls": [
                    {"id": "call_a", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}},
                    {"type": "function", "function": {"name": "noop", "arguments": ""}}
                ]},
                "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        }));
        let out = to_messages_response(resp, &request(), &Config::default()).unwrap();
        assert_eq!(out.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(out.content.len(), 3);
        assert_eq!(
            out.content[1],
            ResponseBlock::ToolUse {
                id: "call_a".into(),
                name: "get_weather".into(),
                input: json!({"city": "Paris"})
            }
        );
        match &out.content[2] {
            ResponseBlock::ToolUse { id, input, .. } => {
                assert!(id.starts_with("toolu_"));
                assert_eq!(input, &json!({}));
            }
            other => panic!("unexpected block {other:?}"),
        }
        assert!(out.id.starts_with("msg_"));
    }

    #[test]
    fn malformed_arguments_are_kept_raw() {
        let resp = backend(json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "c", "function": {"name": "f", "arguments": "{\"a\": 1"}}
            ]}, "finish_reason": "tool_calls"}]
        }));
        let out = to_messages_response(resp, &request(), &Config::default()).unwrap();
        assert_eq!(
            out.content,
            vec![ResponseBlock::ToolUse {
                id: "c".into(),
                name: "f".into(),
                input: json!({"raw_arguments": "{\"a\": 1"})
            }]
        );
    }

    #[test]
    fn legacy_function_call() {
        let resp = backend(json!({
            "choices": [{"message": {"function_call": {"name": "f", "arguments": "{\"x\":2}"}},
                         "finish_reason": "function_call"}]
        }));
        let out = to_messages_response(resp, &request(), &Config::default()).unwrap();
        assert_eq!(out.stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(&out.content[0], ResponseBlock::ToolUse { name, input, .. }
            if name == "f" && input == &json!({"x": 2})));
    }

    #[test]
    fn empty_message_yields_one_empty_text_block() {
        let resp = backend(json!({
            "choices": [{"message": {"content": null}, "finish_reason": "length"}]
        }));
        let out = to_messages_response(resp, &request(), &Config::default()).unwrap();
        assert_eq!(out.content, vec![ResponseBlock::Text { text: String::new() }]);
        assert_eq!(out.stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn no_choices_is_protocol_error() {
        let resp = backend(json!({"id": "x", "choices": []}));
        let err = to_messages_response(resp, &request(), &Config::default()).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[test]
    fn zero_usage_is_estimated_when_enabled() {
        let body = json!({
            "choices": [{"message": {"content": "It is sunny in Paris today."}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
        });

        let out = to_messages_response(backend(body.clone()), &request(), &Config::default()).unwrap();
        assert_eq!(out.usage.input_tokens, estimate_request(&request()));
        assert!(out.usage.output_tokens >= 1);

        let disabled = Config {
            enable_token_estimation: false,
            ..Config::default()
        };
        let out = to_messages_response(backend(body), &request(), &disabled).unwrap();
        assert_eq!(out.usage, Usage::default());
    }

    #[test]
    fn unknown_finish_reason_is_end_turn() {
        let resp = backend(json!({
            "choices": [{"message": {"content": "x"}, "finish_reason": "guardrail_intervened"}]
        }));
        let out = to_messages_response(resp, &request(), &Config::default()).unwrap();
        assert_eq!(out.stop_reason, Some(StopReason::EndTurn));
    }
}
