//! Stop-sequence detection with a two-delta lookback

/// Why generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop marker matched the latest delta or the latest two
    Marker,
    /// The completion counter reached `max_tokens - 1`
    TokenBudget,
    /// The process closed its output after generation began
    EndOfStream,
}

impl StopReason {
    /// OpenAI `finish_reason`; every way of ending a turn reports `stop`
    pub fn finish_reason(&self) -> &'static str {
        "stop"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop(StopReason),
}

/// Per-request generation bookkeeping
#[derive(Debug, Clone, Default)]
pub struct GenerationState {
    pub response_text: String,
    pub completion_tokens: usize,
    pub response_started: bool,
    pub last_delta: Option<String>,
}

/// Checks each delta against the stop markers and the token budget.
///
/// Markers are exact-match literals compared against the latest delta and
/// against the previous delta concatenated with it, never against the whole
/// accumulated text.
#[derive(Debug)]
pub struct StopDetector {
    markers: Vec<String>,
    max_tokens: Option<u32>,
    state: GenerationState,
}

impl StopDetector {
    pub fn new(markers: Vec<String>, max_tokens: Option<u32>) -> Self {
        Self {
            markers,
            max_tokens,
            state: GenerationState::default(),
        }
    }

    pub fn inspect(&mut self, delta: &str) -> Decision {
        self.state.response_started = true;

        let combined = format!("{}{}", self.state.last_delta.as_deref().unwrap_or(""), delta);
        if self.is_marker(delta) || self.is_marker(&combined) {
            return Decision::Stop(StopReason::Marker);
        }

        if let Some(max) = self.max_tokens {
            if self.state.completion_tokens >= max.saturating_sub(1) as usize {
                return Decision::Stop(StopReason::TokenBudget);
            }
        }

        self.state.completion_tokens += 1;
        self.state.response_text.push_str(delta);
        self.state.last_delta = Some(delta.to_string());
        Decision::Continue
    }

    fn is_marker(&self, text: &str) -> bool {
        self.markers.iter().any(|m| m == text)
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn into_state(self) -> GenerationState {
        self.state
    }
}
