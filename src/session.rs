//! Session continuity
//!
//! Decides whether an incoming chat is the next turn of the conversation the
//! live inference process already holds in its context. When it is, only the
//! new turn is fed to the process; otherwise the process is replaced.
//!
//! # Example
//!
//! ```rust,ignore
//! use herd::session::{is_continuation, split_conversation, RequestMemo};
//!
//! let (prior, last) = split_conversation(request.messages)?;
//! if is_continuation(process_alive, memo.as_ref(), &prior) {
//!     // feed profile.interaction_prompt(&last)
//! }
//! ```

use crate::{HerdError, Message, Result, Role};

/// The most recently completed request, kept for the next continuity check
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMemo {
    /// Full turn: prior messages, the new messages and the generated reply
    Chat { messages: Vec<Message> },
    Completion { prompt: String },
    Embedding { input: Vec<String> },
}

impl RequestMemo {
    /// Memo for a finished chat turn
    pub fn chat_turn(prior: &[Message], last: &[Message], reply: impl Into<String>) -> Self {
        let mut messages = Vec::with_capacity(prior.len() + last.len() + 1);
        messages.extend_from_slice(prior);
        messages.extend_from_slice(last);
        messages.push(Message::assistant(reply));
        RequestMemo::Chat { messages }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RequestMemo::Chat { .. } => "chat",
            RequestMemo::Completion { .. } => "completion",
            RequestMemo::Embedding { .. } => "embedding",
        }
    }
}

/// Split a conversation into `(prior, last)`.
///
/// `last` is the final message, plus the one before it when the final
/// message is not a user turn.
pub fn split_conversation(mut messages: Vec<Message>) -> Result<(Vec<Message>, Vec<Message>)> {
    let final_message = messages
        .pop()
        .ok_or_else(|| HerdError::InvalidRequest("messages must not be empty".to_string()))?;

    let mut last = Vec::with_capacity(2);
    if final_message.role != Role::User {
        if let Some(before) = messages.pop() {
            last.push(before);
        }
    }
    last.push(final_message);

    Ok((messages, last))
}

/// Element-wise equality with surrounding whitespace ignored in content
pub fn messages_match(a: &[Message], b: &[Message]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.role == y.role && x.name == y.name && x.content.trim() == y.content.trim()
        })
}

/// Whether a chat with these prior messages continues the live process.
///
/// Requires a live process, a chat memo, and a non-empty prior history
/// equal to the memo's messages.
pub fn is_continuation(process_alive: bool, memo: Option<&RequestMemo>, prior: &[Message]) -> bool {
    if !process_alive || prior.is_empty() {
        return false;
    }
    match memo {
        Some(RequestMemo::Chat { messages }) => messages_match(messages, prior),
        _ => false,
    }
}
