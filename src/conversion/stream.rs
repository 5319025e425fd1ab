//! Chat Completions chunk stream -> Messages API event stream.
//!
//! `StreamTranscoder` is a fold over upstream chunks: each `push` consumes one chunk and
//! returns the events it causes, `finish` and `fail` terminate the sequence. It holds no
//! text beyond the tool-argument fragments that arrive before their call can be announced.
//!
//! The message is finalized at most one fragment after the finish reason: immediately when
//! the finish chunk carries usage, otherwise with the next fragment (normally the trailing
//! usage chunk). `finish` covers upstreams that end right after the finish reason.
//!
//! Emitted sequence:
//! `message_start, ping, (content_block_start, content_block_delta*, content_block_stop)*,
//! message_delta, [error], message_stop`
//!
//! Block indices are a dense local counter; upstream tool-call indices are only used to
//! route argument fragments to their block and never appear in the output.

use std::collections::BTreeMap;

use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::{map_finish_reason, new_message_id, new_tool_use_id};
use crate::errors::ProxyError;
use crate::models::chat::{ChatCompletionChunk, ChatUsage, FunctionCallDelta, ToolCallDelta};
use crate::models::messages::{
    BlockDelta, MessageDeltaBody, MessagesResponse, ResponseBlock, StopReason, StreamEvent,
    Usage,
};
use crate::tokens::TextTally;

/// Upstream slot used for the legacy single `function_call` delta.
const LEGACY_FUNCTION_SLOT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing received yet.
    Idle,
    /// `message_start` sent; blocks may open and close.
    Started,
    /// Finish reason seen and all blocks closed; waiting one fragment for trailing usage.
    Closing,
    /// `message_stop` sent.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text { index: usize },
    Tool { slot: u32, index: usize },
}

#[derive(Debug, Default)]
struct ToolSlot {
    id: Option<String>,
    name: Option<String>,
    /// Argument text received before the block could be started.
    pending: String,
    /// Complete argument text of a started block, checked when it closes.
    args: String,
    started: bool,
    closed: bool,
}

/// Per-request streaming state.
#[derive(Debug)]
pub struct StreamTranscoder {
    message_id: Option<String>,
    model: String,
    /// `Some` when token estimation is enabled.
    estimated_input: Option<u32>,
    phase: Phase,
    open: Option<OpenBlock>,
    next_index: usize,
    tools: BTreeMap<u32, ToolSlot>,
    stop_reason: Option<StopReason>,
    upstream_usage: Option<ChatUsage>,
    output: TextTally,
}

impl StreamTranscoder {
    /// `model` is echoed in `message_start`. `estimated_input` enables usage estimation and is
    /// reported as the input count when the backend sends no usage.
    pub fn new(model: impl Into<String>, estimated_input: Option<u32>) -> Self {
        Self {
            message_id: None,
            model: model.into(),
            estimated_input,
            phase: Phase::Idle,
            open: None,
            next_index: 0,
            tools: BTreeMap::new(),
            stop_reason: None,
            upstream_usage: None,
            output: TextTally::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Number of content blocks started so far.
    pub fn blocks_started(&self) -> usize {
        self.next_index
    }

    /// Consume one upstream chunk.
    pub fn push(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.phase == Phase::Done {
            debug!("chunk received after message_stop; ignored");
            return events;
        }
        let was_closing = self.phase == Phase::Closing;
        if self.phase == Phase::Idle {
            if !chunk.id.is_empty() {
                self.message_id = Some(chunk.id.clone());
            }
            self.start(&mut events);
        }
        if let Some(usage) = chunk.usage {
            self.upstream_usage = Some(usage);
        }

        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            let delta = &choice.delta;
            let has_payload = delta.content.as_deref().is_some_and(|c| !c.is_empty())
                || delta.tool_calls.as_ref().is_some_and(|t| !t.is_empty())
                || delta.function_call.is_some();
            if self.phase == Phase::Closing {
                if has_payload {
                    warn!("content received after finish reason; dropped");
                }
                continue;
            }

            if let Some(text) = delta.content.as_deref().filter(|c| !c.is_empty()) {
                self.text(text, &mut events);
            }
            for call in delta.tool_calls.iter().flatten() {
                self.tool(call, &mut events);
            }
            if let Some(function) = &delta.function_call {
                self.tool(&legacy_call(function), &mut events);
            }
            if let Some(reason) = choice.finish_reason.as_deref() {
                self.flush_unstarted_tools(&mut events);
                self.close_open(&mut events);
                self.stop_reason = Some(map_finish_reason(reason));
                self.phase = Phase::Closing;
            }
        }

        if self.phase == Phase::Closing && (was_closing || chunk.usage.is_some()) {
            events.extend(self.complete());
        }
        events
    }

    /// Upstream ended normally. Without a prior finish reason this is an abnormal end.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        match self.phase {
            Phase::Done => Vec::new(),
            Phase::Idle | Phase::Started => self.fail(&ProxyError::Protocol(
                "upstream stream ended before a finish reason".into(),
            )),
            Phase::Closing => self.complete(),
        }
    }

    /// Upstream failed. Closes whatever is open, reports `stop_reason: error` and the
    /// classified error, and terminates the sequence.
    pub fn fail(&mut self, err: &ProxyError) -> Vec<StreamEvent> {
        match self.phase {
            Phase::Done => return Vec::new(),
            Phase::Closing => {
                warn!(error = %err, "upstream error after finish reason; completing normally");
                return self.finish();
            }
            Phase::Idle | Phase::Started => {}
        }

        warn!(error_type = err.error_type(), error = %err, "stream terminated abnormally");
        let mut events = Vec::new();
        if self.phase == Phase::Idle {
            self.start(&mut events);
        }
        self.close_open(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::Error),
                stop_sequence: None,
            },
            usage: self.final_usage(),
        });
        events.push(err.to_event());
        events.push(StreamEvent::MessageStop);
        self.phase = Phase::Done;
        events
    }

    /// `message_delta` with the stop reason and final usage, then `message_stop`.
    fn complete(&mut self) -> Vec<StreamEvent> {
        self.phase = Phase::Done;
        vec![
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: self.stop_reason,
                    stop_sequence: None,
                },
                usage: self.final_usage(),
            },
            StreamEvent::MessageStop,
        ]
    }

    /// Usage reported in the final `message_delta`.
    pub fn final_usage(&self) -> Usage {
        let reported = self.upstream_usage.unwrap_or_default();
        let usage = Usage {
            input_tokens: u32::try_from(reported.prompt_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(reported.completion_tokens).unwrap_or(u32::MAX),
        };
        match self.estimated_input {
            Some(input) if usage.input_tokens == 0 && usage.output_tokens == 0 => Usage {
                input_tokens: input,
                output_tokens: self.output.tokens(),
            },
            _ => usage,
        }
    }

    fn start(&mut self, events: &mut Vec<StreamEvent>) {
        let id = self.message_id.get_or_insert_with(new_message_id).clone();
        let mut message = MessagesResponse::skeleton(id, self.model.clone());
        message.usage.input_tokens = self.estimated_input.unwrap_or(0);
        events.push(StreamEvent::MessageStart { message });
        events.push(StreamEvent::Ping);
        self.phase = Phase::Started;
    }

    fn text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        let index = match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => {
                self.close_open(events);
                let index = self.allocate_index();
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseBlock::Text {
                        text: String::new(),
                    },
                });
                self.open = Some(OpenBlock::Text { index });
                index
            }
        };
        self.output.push(text);
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn tool(&mut self, call: &ToolCallDelta, events: &mut Vec<StreamEvent>) {
        let key = call.index;
        let slot = self.tools.entry(key).or_default();
        if slot.closed {
            warn!(upstream_index = key, "tool call delta after its block closed; dropped");
            return;
        }

        if let Some(id) = call.id.as_deref().filter(|s| !s.is_empty()) {
            slot.id.get_or_insert_with(|| id.to_string());
        }
        let function = call.function.as_ref();
        if let Some(name) = function.and_then(|f| f.name.as_deref()).filter(|s| !s.is_empty()) {
            slot.name.get_or_insert_with(|| name.to_string());
        }
        if let Some(args) = function.and_then(|f| f.arguments.as_deref()) {
            slot.pending.push_str(args);
        }

        let started = slot.started;
        let ready = slot.name.is_some() && (slot.id.is_some() || !slot.pending.is_empty());
        if started {
            self.flush_tool_args(key, events);
        } else if ready {
            self.start_tool(key, events);
        }
    }

    /// Open the block for `key`, closing whatever else is open, then flush buffered arguments.
    fn start_tool(&mut self, key: u32, events: &mut Vec<StreamEvent>) {
        self.close_open(events);
        let index = self.allocate_index();
        let Some(slot) = self.tools.get_mut(&key) else {
            return;
        };
        slot.started = true;
        let id = slot.id.get_or_insert_with(new_tool_use_id).clone();
        let name = slot.name.clone().unwrap_or_default();
        self.output.push(&name);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseBlock::ToolUse {
                id,
                name,
                input: Value::Object(Default::default()),
            },
        });
        self.open = Some(OpenBlock::Tool { slot: key, index });
        self.flush_tool_args(key, events);
    }

    fn flush_tool_args(&mut self, key: u32, events: &mut Vec<StreamEvent>) {
        let Some(OpenBlock::Tool { slot: open_key, index }) = self.open else {
            return;
        };
        if open_key != key {
            return;
        }
        let Some(slot) = self.tools.get_mut(&key) else {
            return;
        };
        if slot.pending.is_empty() {
            return;
        }
        let partial = std::mem::take(&mut slot.pending);
        slot.args.push_str(&partial);
        self.output.push(&partial);
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: partial,
            },
        });
    }

    /// Announce calls whose name arrived but which never became ready (no id, no arguments).
    fn flush_unstarted_tools(&mut self, events: &mut Vec<StreamEvent>) {
        let keys: Vec<u32> = self
            .tools
            .iter()
            .filter(|(_, s)| !s.started && !s.closed)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let named = self.tools.get(&key).is_some_and(|s| s.name.is_some());
            if named {
                self.start_tool(key, events);
            } else {
                warn!(upstream_index = key, "tool call without a name; dropped");
                if let Some(slot) = self.tools.get_mut(&key) {
                    slot.closed = true;
                }
            }
        }
    }

    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(open) = self.open.take() else {
            return;
        };
        match open {
            OpenBlock::Text { index } => events.push(StreamEvent::ContentBlockStop { index }),
            OpenBlock::Tool { slot: key, index } => {
                if let Some(slot) = self.tools.get_mut(&key) {
                    slot.closed = true;
                    let args = slot.args.trim();
                    if !args.is_empty() && serde_json::from_str::<Value>(args).is_err() {
                        warn!(
                            tool = slot.name.as_deref().unwrap_or_default(),
                            "tool arguments are not valid JSON at block close"
                        );
                    }
                }
                events.push(StreamEvent::ContentBlockStop { index });
            }
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

impl Drop for StreamTranscoder {
    fn drop(&mut self) {
        if self.phase != Phase::Done {
            debug!(
                phase = ?self.phase,
                blocks = self.next_index,
                "stream dropped before completion"
            );
        }
    }
}

fn legacy_call(function: &FunctionCallDelta) -> ToolCallDelta {
    ToolCallDelta {
        index: LEGACY_FUNCTION_SLOT,
        id: None,
        call_type: Some("function".to_string()),
        function: Some(function.clone()),
    }
}

/// Run a finite chunk sequence through a fresh transcoder, including termination.
pub fn transcode<'a, I>(model: &str, estimated_input: Option<u32>, chunks: I) -> Vec<StreamEvent>
where
    I: IntoIterator<Item = &'a ChatCompletionChunk>,
{
    let mut transcoder = StreamTranscoder::new(model, estimated_input);
    let mut events: Vec<StreamEvent> = chunks
        .into_iter()
        .flat_map(|c| transcoder.push(c))
        .collect();
    events.extend(transcoder.finish());
    events
}

/// Drive `transcoder` over an upstream chunk stream.
///
/// The upstream is dropped as soon as the transcoder is done, whether by `message_stop` or
/// by an upstream error, so a backend that keeps the connection open after the finish
/// reason does not hold the caller's stream open. Dropping the returned stream drops the
/// upstream with it.
pub fn transcode_stream<S>(
    upstream: S,
    transcoder: StreamTranscoder,
) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = Result<ChatCompletionChunk, ProxyError>> + Send + Unpin + 'static,
{
    stream::unfold(Some((upstream, transcoder)), |state| async move {
        let (mut upstream, mut transcoder) = state?;
        match upstream.next().await {
            Some(Ok(chunk)) => {
                let events = transcoder.push(&chunk);
                let next = (!transcoder.is_done()).then_some((upstream, transcoder));
                Some((events, next))
            }
            Some(Err(err)) => Some((transcoder.fail(&err), None)),
            None => Some((transcoder.finish(), None)),
        }
    })
    .flat_map(stream::iter)
}
