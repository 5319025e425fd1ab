//! Heuristic token estimation, used only when the backend reports no usage.
//!
//! Every character contributes a fixed weight by script: CJK code points cost
//! `1 / CJK_CHARS_PER_TOKEN`, everything else `1 / LATIN_CHARS_PER_TOKEN`. A mixed text
//! therefore lands between the two rates in proportion to its CJK fraction, and since
//! weights only accumulate, the estimate never shrinks when text is appended.

use crate::models::messages::{tool_result_text, ContentBlock, MessagesRequest};

pub const LATIN_CHARS_PER_TOKEN: f64 = 4.0;
pub const CJK_CHARS_PER_TOKEN: f64 = 1.2;

/// Role marker of one message.
pub const ROLE_TOKENS: u32 = 1;
/// Separators and framing around one message.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 3;
/// Model name and request parameters.
pub const REQUEST_OVERHEAD_TOKENS: u32 = 5;

/// Whether `c` is a CJK ideograph, kana, hangul syllable, or CJK punctuation/fullwidth form.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F     // CJK symbols and punctuation
        | 0x3040..=0x30FF   // Hiragana, Katakana
        | 0x3400..=0x4DBF   // CJK Unified Ideographs Extension A
        | 0x4E00..=0x9FFF   // CJK Unified Ideographs
        | 0xAC00..=0xD7AF   // Hangul syllables
        | 0xF900..=0xFAFF   // CJK Compatibility Ideographs
        | 0xFF00..=0xFFEF   // Halfwidth and fullwidth forms
        | 0x20000..=0x2FA1F // Supplementary ideographic planes
    )
}

/// Running character counts by script.
///
/// Tallying is incremental, so a stream can be estimated without keeping its text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextTally {
    cjk: u64,
    other: u64,
}

impl TextTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        let mut tally = Self::new();
        tally.push(text);
        tally
    }

    pub fn push(&mut self, text: &str) {
        for c in text.chars() {
            if is_cjk(c) {
                self.cjk += 1;
            } else {
                self.other += 1;
            }
        }
    }

    pub fn chars(&self) -> u64 {
        self.cjk + self.other
    }

    pub fn is_empty(&self) -> bool {
        self.chars() == 0
    }

    /// Share of CJK characters, 0.0 for empty text.
    pub fn cjk_fraction(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.cjk as f64 / self.chars() as f64
        }
    }

    /// Estimated token count: 0 for empty text, otherwise at least 1.
    pub fn tokens(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        let weight =
            self.cjk as f64 / CJK_CHARS_PER_TOKEN + self.other as f64 / LATIN_CHARS_PER_TOKEN;
        (weight.ceil() as u32).max(1)
    }
}

/// Estimate the tokens of a single text.
pub fn estimate_text(text: &str) -> u32 {
    TextTally::from_text(text).tokens()
}

/// Estimate one message: content plus role marker and framing overhead.
fn estimate_message(blocks: &[ContentBlock]) -> u32 {
    let mut tally = TextTally::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => tally.push(text),
            ContentBlock::ToolUse { name, input, .. } => {
                tally.push(name);
                tally.push(&input.to_string());
            }
            ContentBlock::ToolResult { content, .. } => tally.push(&tool_result_text(content)),
            // Image payloads are priced by the backend, not by their base64 length.
            ContentBlock::Image { .. } | ContentBlock::Unsupported => {}
        }
    }
    tally.tokens() + ROLE_TOKENS + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate the prompt size of a whole request: messages, system prompt and tool schemas.
pub fn estimate_request(req: &MessagesRequest) -> u32 {
    let messages: u32 = req
        .messages
        .iter()
        .map(|m| estimate_message(&m.content.blocks()))
        .sum();

    let system = req
        .system
        .as_ref()
        .map(|s| estimate_text(&s.text()))
        .unwrap_or(0);

    let tools: u32 = req
        .tools
        .iter()
        .flatten()
        .map(|t| {
            let mut tally = TextTally::from_text(&t.name);
            if let Some(d) = &t.description {
                tally.push(d);
            }
            tally.push(&t.input_schema.to_string());
            tally.tokens()
        })
        .sum();

    (messages + system + tools + REQUEST_OVERHEAD_TOKENS).max(1)
}
