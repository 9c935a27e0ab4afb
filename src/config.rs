//! Configuration for the Herd server

use crate::{HerdError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the server and the inference processes it drives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Model weights used when a request carries no bearer token
    pub model_path: Option<PathBuf>,

    /// Directory holding the llama.cpp `main` and `embedding` binaries
    pub llama_dir: PathBuf,

    /// Directory holding ggml example binaries (`gpt-neox`, `gpt-j`, ...)
    pub ggml_dir: PathBuf,

    /// Number of threads passed to the inference binary
    pub threads: u32,

    /// Extra flags appended verbatim to llama.cpp invocations
    pub engine_args: Vec<String>,

    /// Quiet period after which a newline is written to the process
    pub stall_timeout: Duration,

    /// Consecutive nudges without output before the request fails
    pub stall_nudge_limit: u32,

    /// How long a superseded process gets to exit after SIGINT
    pub shutdown_grace: Duration,

    /// Request queue polling
    pub queue_poll: QueuePollConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("herd");

        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            model_path: None,
            llama_dir: base.join("llama.cpp"),
            ggml_dir: base.join("ggml").join("build").join("bin"),
            threads: num_cpus::get() as u32,
            engine_args: Vec::new(),
            stall_timeout: Duration::from_secs(20),
            stall_nudge_limit: 3,
            shutdown_grace: Duration::from_secs(2),
            queue_poll: QueuePollConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the fallback model path
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Set the llama.cpp build directory
    pub fn with_llama_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.llama_dir = path.into();
        self
    }

    /// Set the ggml binaries directory
    pub fn with_ggml_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.ggml_dir = path.into();
        self
    }

    /// Set the stall watchdog interval
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Append pass-through engine flags
    pub fn with_engine_args(mut self, args: Vec<String>) -> Self {
        self.engine_args = args;
        self
    }

    /// Resolve the model path for a request.
    ///
    /// The bearer token, when present, *is* the model path; otherwise the
    /// configured path is used. Neither being set is a configuration error.
    pub fn resolve_model_path(&self, bearer: Option<&str>) -> Result<PathBuf> {
        match bearer.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => Ok(PathBuf::from(token)),
            None => self.model_path.clone().ok_or_else(|| {
                HerdError::Config(
                    "no model path: pass the model file as bearer token or re-run with MODEL set"
                        .to_string(),
                )
            }),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Polling parameters for the request queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePollConfig {
    /// Fixed part of the poll interval
    pub interval: Duration,

    /// Upper bound of the random part added to each poll
    pub jitter: Duration,
}

impl Default for QueuePollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        }
    }
}

/// ggml example binaries, by model path keyword. First match wins.
const GGML_KEYWORDS: &[(&str, &str)] = &[
    ("redpajama", "gpt-neox"),
    ("dante", "gpt-neox"),
    ("pythia", "gpt-neox"),
    ("stablelm", "gpt-neox"),
    ("dolly", "dolly-v2"),
    ("gpt4all-j", "gpt-j"),
    ("gpt-j", "gpt-j"),
    ("starcoder", "starcoder"),
    ("mpt-", "mpt"),
    ("gpt-2", "gpt-2"),
    ("gpt2", "gpt-2"),
];

fn starts_word(haystack: &str, keyword: &str) -> bool {
    haystack.match_indices(keyword).any(|(at, _)| {
        haystack[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

/// Which inference binary family runs a given model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFamily {
    /// llama.cpp `main`: interactive mode, reverse prompts
    LlamaCpp,
    /// A ggml example binary: one-shot, no stop flags
    Ggml { binary: &'static str },
}

impl EngineFamily {
    /// Pick the engine family from the model path (case-insensitive).
    ///
    /// Keywords only match at the start of a word, so `prompt-` never
    /// selects `mpt`.
    pub fn detect(model_path: &Path) -> Self {
        let path = model_path.to_string_lossy().to_lowercase();
        GGML_KEYWORDS
            .iter()
            .find(|(keyword, _)| starts_word(&path, keyword))
            .map(|&(_, binary)| EngineFamily::Ggml { binary })
            .unwrap_or(EngineFamily::LlamaCpp)
    }

    /// Path of the generation binary
    pub fn executable(&self, config: &ServerConfig) -> PathBuf {
        match self {
            EngineFamily::LlamaCpp => config.llama_dir.join("main"),
            EngineFamily::Ggml { binary } => config.ggml_dir.join(binary),
        }
    }

    /// Whether the process can stay alive between turns
    pub fn supports_interactive(&self) -> bool {
        matches!(self, EngineFamily::LlamaCpp)
    }

    /// Whether stop sequences can be passed as `--reverse-prompt`
    pub fn supports_stop_flags(&self) -> bool {
        matches!(self, EngineFamily::LlamaCpp)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineFamily::LlamaCpp => "llama.cpp",
            EngineFamily::Ggml { binary } => *binary,
        }
    }
}

/// Sampling flags for one engine invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum tokens to generate (None = unbounded)
    pub max_tokens: Option<u32>,

    /// `--temp`
    pub temperature: f32,

    /// `--top_p`
    pub top_p: f32,

    /// Top-k sampling
    pub top_k: u32,

    /// Prompt context size
    pub ctx_size: Option<u32>,

    /// RNG seed (-1 = random)
    pub seed: Option<i64>,

    /// Repetition penalty
    pub repeat_penalty: Option<f32>,

    /// Stop sequences
    pub stop: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::llama_cpp()
    }
}

impl GenerationConfig {
    /// llama.cpp defaults
    pub fn llama_cpp() -> Self {
        Self {
            max_tokens: Some(1000),
            temperature: 0.7,
            top_p: 0.1,
            top_k: 40,
            ctx_size: Some(2048),
            seed: Some(-1),
            repeat_penalty: Some(1.176_470_6),
            stop: vec![],
        }
    }

    /// ggml example binaries understand fewer flags
    pub fn ggml() -> Self {
        Self {
            max_tokens: Some(1000),
            temperature: 0.8,
            top_p: 0.1,
            top_k: 40,
            ctx_size: None,
            seed: None,
            repeat_penalty: None,
            stop: vec![],
        }
    }

    pub fn for_engine(family: EngineFamily) -> Self {
        match family {
            EngineFamily::LlamaCpp => Self::llama_cpp(),
            EngineFamily::Ggml { .. } => Self::ggml(),
        }
    }

    pub fn with_max_tokens(mut self, n: Option<u32>) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = Some(penalty);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    /// Overlay OpenAI request parameters. A negative `max_tokens` means
    /// "no limit", which the engines spell `-1`.
    pub fn apply_request(
        mut self,
        temperature: Option<f32>,
        max_tokens: Option<i64>,
        top_p: Option<f32>,
    ) -> Self {
        if let Some(t) = temperature {
            self.temperature = t;
        }
        if let Some(n) = max_tokens {
            self.max_tokens = u32::try_from(n).ok();
        }
        if let Some(p) = top_p {
            self.top_p = p;
        }
        self
    }

    /// Flag/value list for the given engine family
    pub fn to_args(&self, family: EngineFamily) -> Vec<String> {
        let n_predict = self
            .max_tokens
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-1".to_string());

        let mut args = vec![
            "--temp".to_string(),
            self.temperature.to_string(),
            "--n_predict".to_string(),
            n_predict,
            "--top_p".to_string(),
            self.top_p.to_string(),
            "--top_k".to_string(),
            self.top_k.to_string(),
        ];

        if let Some(ctx) = self.ctx_size {
            args.extend(["-c".to_string(), ctx.to_string()]);
        }
        if let Some(seed) = self.seed {
            args.extend(["--seed".to_string(), seed.to_string()]);
        }
        if let Some(penalty) = self.repeat_penalty {
            args.extend(["--repeat_penalty".to_string(), penalty.to_string()]);
        }

        if family.supports_stop_flags() {
            for stop in &self.stop {
                args.extend(["--reverse-prompt".to_string(), stop.clone()]);
            }
        }

        args
    }
}
