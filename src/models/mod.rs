//! Data models for the Messages API (caller side) and the Chat Completions API (backend side).
//!
//! This module groups two submodules:
//! - `messages`: Anthropic Messages API requests, responses and streaming events.
//! - `chat`: the OpenAI Chat Completions subset the proxy sends and receives.
//!
//! The mapping logic between them lives in `crate::conversion`.

pub mod chat;
pub mod messages;

pub use chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
pub use messages::{
    ContentBlock, MessagesRequest, MessagesResponse, ResponseBlock, StopReason, StreamEvent,
    Usage,
};
