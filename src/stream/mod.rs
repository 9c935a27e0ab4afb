//! Turning raw inference stdout into content deltas
//!
//! The engine first echoes the prompt it was given, then generates. The
//! decoder swallows everything up to the echo boundary and afterwards hands
//! each chunk through unchanged, one delta per chunk.

mod stop;

pub use stop::{Decision, GenerationState, StopDetector, StopReason};

use crate::prompt::EchoBoundary;
use regex::Regex;
use std::sync::OnceLock;

fn ansi_sequence() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex"))
}

fn ansi_partial_tail() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b(\[[0-9;?]*)?$").expect("static regex"))
}

/// Remove terminal colour/cursor sequences from a complete string
pub fn strip_ansi_codes(text: &str) -> String {
    ansi_sequence().replace_all(text, "").into_owned()
}

/// Chunk-aware ANSI stripper: an escape split across two reads is held
/// back until the rest of it arrives.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    pending: String,
}

impl AnsiStripper {
    pub fn push(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        let mut clean = strip_ansi_codes(&text);
        if let Some(tail) = ansi_partial_tail().find(&clean) {
            self.pending = clean[tail.start()..].to_string();
            clean.truncate(tail.start());
        }
        clean
    }
}

/// Where the decoder is relative to the echoed prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    AwaitingEcho,
    Streaming,
}

/// Suppress-until-echo filter over one process's stdout
#[derive(Debug)]
pub struct StreamDecoder {
    prompt: String,
    boundary: EchoBoundary,
    state: DecoderState,
    buffer: String,
    ansi: AnsiStripper,
}

impl StreamDecoder {
    /// Decoder for a freshly launched process that will echo `prompt`
    pub fn new(prompt: impl Into<String>, boundary: EchoBoundary) -> Self {
        let prompt = prompt.into();
        let state = if prompt.is_empty() {
            DecoderState::Streaming
        } else {
            DecoderState::AwaitingEcho
        };
        Self {
            prompt,
            boundary,
            state,
            buffer: String::new(),
            ansi: AnsiStripper::default(),
        }
    }

    /// Decoder for a warm process fed over stdin; interactive input is not echoed
    pub fn streaming() -> Self {
        Self::new(String::new(), EchoBoundary::PromptLength)
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Feed one stdout chunk; returns the content delta, if any
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        let clean = self.ansi.push(chunk);
        if clean.is_empty() {
            return None;
        }

        match self.state {
            DecoderState::Streaming => Some(clean),
            DecoderState::AwaitingEcho => {
                self.buffer.push_str(&clean);
                let tail_start = match self.boundary {
                    EchoBoundary::PromptLength => self.length_boundary(),
                    EchoBoundary::OccurrenceCount if is_diagnostic(&clean) => None,
                    EchoBoundary::OccurrenceCount => self.occurrence_boundary(),
                }?;

                self.state = DecoderState::Streaming;
                let buffer = std::mem::take(&mut self.buffer);
                let tail = &buffer[tail_start..];
                (!tail.is_empty()).then(|| tail.to_string())
            }
        }
    }

    /// Byte offset where generated text begins, once the output is longer than the prompt
    fn length_boundary(&self) -> Option<usize> {
        if self.buffer.len() <= self.prompt.len() {
            return None;
        }
        let start = match self.buffer.find(&self.prompt) {
            Some(at) => at + self.prompt.len(),
            None => ceil_char_boundary(&self.buffer, self.prompt.len()),
        };
        Some(start)
    }

    /// Byte offset after the last bare (unquoted) echo of the prompt, once
    /// bare echoes outnumber quoted mentions
    fn occurrence_boundary(&self) -> Option<usize> {
        let quoted = format!("'{}'", self.prompt);
        let total = self.buffer.matches(self.prompt.as_str()).count();
        let quoted_count = self.buffer.matches(quoted.as_str()).count();
        if total <= quoted_count {
            return None;
        }

        self.buffer
            .match_indices(self.prompt.as_str())
            .filter(|(at, _)| !self.is_quoted_at(*at))
            .map(|(at, _)| at + self.prompt.len())
            .last()
    }

    fn is_quoted_at(&self, at: usize) -> bool {
        let end = at + self.prompt.len();
        at > 0
            && self.buffer.as_bytes()[at - 1] == b'\''
            && self.buffer.as_bytes().get(end) == Some(&b'\'')
    }
}

/// Loader chatter that must never be mistaken for the start of generation
fn is_diagnostic(chunk: &str) -> bool {
    chunk == "."
        || chunk.contains("model_load")
        || chunk.contains("main: token")
        || chunk.contains("main: prompt")
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index.min(text.len())
}
