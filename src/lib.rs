#![forbid(unsafe_code)]
#![doc = r#"
Messages2Chat

Serve the Anthropic Messages API on top of any OpenAI Chat Completions backend (OpenAI,
Azure OpenAI, or a compatible local server). Callers speak Messages; the backend sees
Chat Completions; responses, including streams, are translated back.

Crate highlights
- Library: pure conversion via `to_chat_request`, `to_messages_response` and the
  `StreamTranscoder` fold over streaming chunks.
- HTTP server (in `server`): `POST /v1/messages`, `POST /v1/messages/count_tokens`, `GET /health`.
- Models: request/response/event types for both wire formats.

Modules
- `models`: Data structures for Messages and Chat Completions.
- `conversion`: Mapping logic Messages <-> Chat Completions, including streaming.
- `model_map`: Requested model id -> configured backend model.
- `tokens`: Heuristic token estimation used when the backend reports no usage.
- `errors`: Error taxonomy and the Messages API error envelope.
- `upstream`: Backend client with retry/timeout policy.
- `server`: Axum router/handlers.
- `config`: Environment configuration.
- `util`: Shared helpers (tracing, HTTP client, CORS, SSE framing).
"#]

pub mod config;
pub mod conversion;
pub mod errors;
pub mod model_map;
pub mod models;
pub mod server;
pub mod tokens;
pub mod upstream;
pub mod util;

pub use crate::config::Config;
pub use crate::conversion::{to_chat_request, to_messages_response, StreamTranscoder};
pub use crate::errors::ProxyError;

// Re-export model namespaces for convenience (downstream users can do `use messages2chat::chat`).
pub use crate::models::{chat, messages};
