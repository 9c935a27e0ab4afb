//! # Herd: a local OpenAI-compatible front for llama.cpp
//!
//! Chat requests go in as OpenAI JSON, come out as command-line invocations
//! of a local inference binary, and its stdout is turned back into
//! OpenAI-shaped responses or SSE chunks.
//!
//! ```rust,ignore
//! use herd::{Herd, ServerConfig};
//!
//! let herd = Herd::new(ServerConfig::default().with_model_path("models/vicuna-7b.bin"));
//! herd::api::serve(herd).await?;
//! ```
//!
//! One inference process at a time. Multi-turn chats reuse the warm process
//! when the conversation is a strict continuation of the previous one.

pub mod api;
pub mod config;
pub mod gate;
pub mod process;
pub mod prompt;
pub mod runtime;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testing;

// Public surface
pub use config::{EngineFamily, GenerationConfig, ServerConfig};
pub use prompt::{EchoBoundary, ProfileKind, PromptProfile};
pub use runtime::{
    ChatRequest, Completion, CompletionRequest, EmbeddingRequest, Embeddings, GenerationEvent, Herd,
    Usage,
};
pub use session::RequestMemo;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    /// Messages without a role are treated as assistant output
    #[default]
    Assistant,
    /// Any role string we do not know; rendered with the assistant label
    #[serde(other)]
    Unknown,
}

/// A chat message
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }

    /// Attach a speaker name, rendered as `label (name):`
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Result type for Herd operations
pub type Result<T> = std::result::Result<T, HerdError>;

/// Errors that can occur while serving a request
#[derive(Debug, thiserror::Error)]
pub enum HerdError {
    #[error("Model configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to launch inference process: {0}")]
    Launch(String),

    #[error("Inference process exited (code {code:?}): {stderr}")]
    ProcessExited { code: Option<i32>, stderr: String },

    #[error("Inference process stalled after {nudges} resume attempts")]
    Stalled { nudges: u32 },

    #[error("Malformed inference output: {0}")]
    MalformedOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request cancelled by client")]
    Cancelled,
}
