use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model_map::select_model;
use crate::models::chat::{
    self, ChatCompletionRequest, ChatContent, ChatMessage, ContentPart, FunctionCall, FunctionDef,
    ImageUrl, StreamOptions, ToolCall, ToolDefinition,
};
use crate::models::messages::{
    self, tool_result_text, ContentBlock, MessagesRequest, Tool, ToolChoice,
};

/// Most stop sequences a Chat Completions backend accepts.
pub const MAX_STOP_SEQUENCES: usize = 4;

/// Marks a `tool_result` with `is_error: true`; Chat Completions tool messages have no flag.
pub const TOOL_ERROR_PREFIX: &str = "Error: ";

/// Build the backend request for a Messages API request.
///
/// Mapping rules:
/// - model: resolved through `select_model` (haiku -> SMALL, sonnet/opus -> BIG).
/// - system: becomes a leading `system` message when non-empty.
/// - user turns: `tool_result` blocks become standalone `tool` messages (placed first, so they
///   directly follow the assistant turn that issued the calls); remaining text/images form one
///   user message.
/// - assistant turns: text becomes `content`, `tool_use` blocks become `tool_calls`.
/// - max_tokens: values <= 0 or below MIN_TOKENS_LIMIT use DEFAULT_MAX_TOKENS; others are capped
///   at MAX_TOKENS_LIMIT.
/// - stop_sequences: truncated to `MAX_STOP_SEQUENCES`.
/// - tools/tool_choice: function descriptors with the input schema passed through as `parameters`.
/// - metadata.user_id: forwarded as `user`.
/// - streaming requests ask for a trailing usage chunk (`stream_options.include_usage`).
pub fn to_chat_request(req: &MessagesRequest, config: &Config) -> ChatCompletionRequest {
    let mut out = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        let text = system.text();
        if !text.trim().is_empty() {
            out.push(ChatMessage::text(chat::Role::System, text));
        }
    }

    for msg in &req.messages {
        let blocks = msg.content.blocks();
        match msg.role {
            messages::Role::User => map_user_turn(&blocks, &mut out),
            messages::Role::Assistant => out.push(map_assistant_turn(&blocks)),
        }
    }

    let tools = req
        .tools
        .as_ref()
        .filter(|ts| !ts.is_empty())
        .map(|ts| ts.iter().map(map_tool).collect::<Vec<_>>());

    let tool_choice = match (&req.tool_choice, &tools) {
        (Some(choice), Some(_)) => Some(map_tool_choice(choice)),
        (Some(_), None) => {
            debug!("tool_choice without tools; not forwarded");
            None
        }
        (None, _) => None,
    };

    let stop = req.stop_sequences.as_ref().and_then(|seqs| {
        if seqs.len() > MAX_STOP_SEQUENCES {
            debug!(
                given = seqs.len(),
                kept = MAX_STOP_SEQUENCES,
                "truncating stop sequences"
            );
        }
        let kept: Vec<String> = seqs.iter().take(MAX_STOP_SEQUENCES).cloned().collect();
        (!kept.is_empty()).then_some(kept)
    });

    if req.top_k.is_some() {
        debug!("top_k has no Chat Completions equivalent; ignored");
    }

    let user = req
        .metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let stream = req.is_stream();

    ChatCompletionRequest {
        model: select_model(&req.model, config),
        messages: out,
        max_tokens: Some(effective_max_tokens(req.max_tokens, config)),
        temperature: req.temperature,
        top_p: req.top_p,
        stop,
        user,
        tools,
        tool_choice,
        stream: req.stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    }
}

/// Substitute the default for unset/too-small requests, cap everything else at the limit.
pub fn effective_max_tokens(requested: i64, config: &Config) -> u32 {
    if requested <= 0 || requested < i64::from(config.min_tokens_limit) {
        config.default_max_tokens
    } else {
        requested.min(i64::from(config.max_tokens_limit)) as u32
    }
}

fn map_user_turn(blocks: &[ContentBlock], out: &mut Vec<ChatMessage>) {
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut has_image = false;
    let mut had_tool_results = false;

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => match source.image_url() {
                Some(url) => {
                    has_image = true;
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url },
                    });
                }
                None => warn!("dropping image block with unsupported source kind"),
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                had_tool_results = true;
                let mut text = tool_result_text(content);
                if is_error.unwrap_or(false) {
                    debug!(tool_use_id = %tool_use_id, "forwarding failed tool result");
                    text = format!("{TOOL_ERROR_PREFIX}{text}");
                }
                out.push(ChatMessage::tool_result(tool_use_id.clone(), text));
            }
            ContentBlock::ToolUse { name, .. } => {
                warn!(tool = %name, "dropping tool_use block in user message");
            }
            ContentBlock::Unsupported => warn!("dropping unsupported content block in user message"),
        }
    }

    if parts.is_empty() {
        if !had_tool_results {
            out.push(ChatMessage::text(chat::Role::User, ""));
        }
        return;
    }

    let content = if has_image {
        ChatContent::Parts(parts)
    } else {
        ChatContent::Text(join_text(&parts))
    };
    out.push(ChatMessage {
        role: chat::Role::User,
        content: Some(content),
        tool_call_id: None,
        tool_calls: None,
    });
}

fn map_assistant_turn(blocks: &[ContentBlock]) -> ChatMessage {
    let mut texts: Vec<&str> = Vec::new();
    let mut calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: tool_arguments(input),
                },
            }),
            ContentBlock::Image { .. } => warn!("dropping image block in assistant message"),
            ContentBlock::ToolResult { tool_use_id, .. } => {
                warn!(tool_use_id = %tool_use_id, "dropping tool_result block in assistant message");
            }
            ContentBlock::Unsupported => {
                warn!("dropping unsupported content block in assistant message")
            }
        }
    }

    let content = if texts.is_empty() && !calls.is_empty() {
        None
    } else {
        Some(ChatContent::Text(texts.join("\n")))
    };

    ChatMessage {
        role: chat::Role::Assistant,
        content,
        tool_call_id: None,
        tool_calls: (!calls.is_empty()).then_some(calls),
    }
}

fn join_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            ContentPart::ImageUrl { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Serialized tool input; an absent input is sent as an empty object.
fn tool_arguments(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

fn map_tool(t: &Tool) -> ToolDefinition {
    ToolDefinition::Function {
        function: FunctionDef {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.input_schema.clone(),
        },
    }
}

fn map_tool_choice(choice: &ToolChoice) -> chat::ToolChoice {
    match choice {
        ToolChoice::Auto => chat::ToolChoice::Mode("auto".into()),
        ToolChoice::Any => chat::ToolChoice::Mode("required".into()),
        ToolChoice::None => chat::ToolChoice::Mode("none".into()),
        ToolChoice::Tool { name } => chat::ToolChoice::function(name.clone()),
    }
}
