//! Core Herd runtime
//!
//! Owns the single inference process and everything that decides what to
//! do with it: which binary to launch, whether a chat continues the warm
//! process, and how its output becomes response deltas.

use crate::config::{EngineFamily, GenerationConfig, ServerConfig};
use crate::gate::Gate;
use crate::process::{LaunchSpec, ProcessManager};
use crate::prompt::{EchoBoundary, PromptProfile};
use crate::session::{is_continuation, split_conversation, RequestMemo};
use crate::stream::{
    strip_ansi_codes, Decision, DecoderState, GenerationState, StopDetector, StopReason,
    StreamDecoder,
};
use crate::{HerdError, Message, Result};

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Stop strings for text completions when the request gives none
const DEFAULT_COMPLETION_STOP: &str = "\n\n";

/// Text completions run with a stronger repetition penalty than chat
const COMPLETION_REPEAT_PENALTY: f32 = 1.3;

/// Rough prompt size: one token per four characters
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Token accounting reported with every response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A finished generation turn
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: String,
    pub usage: Usage,
}

impl Completion {
    fn new(state: GenerationState, reason: StopReason, prompt_tokens: usize) -> Self {
        Self {
            usage: Usage::new(prompt_tokens, state.completion_tokens),
            text: state.response_text,
            finish_reason: reason.finish_reason().to_string(),
        }
    }
}

/// What a generation driver reports to its caller, in order
#[derive(Debug)]
pub enum GenerationEvent {
    /// One chunk of generated text
    Delta(String),
    /// Generation ended normally
    Finished(Completion),
    /// Generation ended with an error; nothing follows
    Failed(HerdError),
}

/// A chat turn, already resolved to a model file
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model_path: PathBuf,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i64>,
    pub top_p: Option<f32>,
    /// Extra stop strings on top of the profile's markers
    pub stop: Vec<String>,
}

impl ChatRequest {
    pub fn new(model_path: impl Into<PathBuf>, messages: Vec<Message>) -> Self {
        Self {
            model_path: model_path.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
        }
    }
}

/// A raw text completion
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_path: PathBuf,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i64>,
    pub top_p: Option<f32>,
    /// Empty means `["\n\n"]`
    pub stop: Vec<String>,
}

impl CompletionRequest {
    pub fn new(model_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub model_path: PathBuf,
    pub input: Vec<String>,
}

/// One vector per input, in input order
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub usage: Usage,
}

/// State that only the request holding the gate may touch
struct Slot {
    process: ProcessManager,
    memo: Option<RequestMemo>,
}

/// The Herd runtime
///
/// Serializes requests through a FIFO gate and drives at most one
/// inference process at a time.
///
/// # Example
///
/// ```rust,ignore
/// use herd::{ChatRequest, Herd, Message, ServerConfig};
///
/// let herd = Herd::new(ServerConfig::default());
/// let model = herd.resolve_model_path(Some("/models/vicuna-7b.bin"))?;
/// let (tx, mut rx) = tokio::sync::mpsc::channel(64);
/// let completion = herd.chat(ChatRequest::new(model, vec![Message::user("Hi")]), tx).await?;
/// ```
pub struct Herd {
    config: ServerConfig,
    gate: Gate,
    slot: Mutex<Slot>,
}

impl Herd {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            gate: Gate::new(config.queue_poll.clone()),
            slot: Mutex::new(Slot {
                process: ProcessManager::new(config.shutdown_grace),
                memo: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bearer token if given, otherwise the configured model
    pub fn resolve_model_path(&self, bearer: Option<&str>) -> Result<PathBuf> {
        self.config.resolve_model_path(bearer)
    }

    // ==================== Chat ====================

    /// Run one chat turn, streaming deltas into `sink`.
    ///
    /// Reuses the warm process when the request continues the previous chat;
    /// otherwise launches a fresh one with the full prompt.
    pub async fn chat(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<GenerationEvent>,
    ) -> Result<Completion> {
        let ChatRequest {
            model_path,
            messages,
            temperature,
            max_tokens,
            top_p,
            stop,
        } = request;

        let (prior, last) = split_conversation(messages)?;
        let family = EngineFamily::detect(&model_path);
        let profile = PromptProfile::for_model(&model_path);

        let mut markers = profile.stop_markers.clone();
        for extra in stop {
            if !extra.is_empty() && !markers.contains(&extra) {
                markers.push(extra);
            }
        }
        let generation = GenerationConfig::for_engine(family)
            .apply_request(temperature, max_tokens, top_p)
            .with_stop(markers.clone());

        let initial_prompt = profile.initial_prompt(&prior, &last);
        let prompt_tokens = estimate_tokens(&initial_prompt);

        let _guard = self.gate.acquire().await;
        let mut slot = self.slot.lock().await;
        let slot = &mut *slot;

        let live = match slot.process.current() {
            Some(process) => {
                family.supports_interactive()
                    && process.model_path() == model_path.as_path()
                    && process.is_alive()
            }
            None => false,
        };
        let continued = is_continuation(live, slot.memo.take().as_ref(), &prior);

        let mut decoder = None;
        if continued {
            if let Some(process) = slot.process.current() {
                let stale = process.drain_pending();
                if stale > 0 {
                    debug!(bytes = stale, "dropped output left from the previous turn");
                }
                let interaction = profile.interaction_prompt(&last);
                match process.feed(&interaction).await {
                    Ok(()) => {
                        info!(pid = ?process.pid(), "continuing chat in warm process");
                        decoder = Some(StreamDecoder::streaming());
                    }
                    Err(e) => warn!(error = %e, "warm process rejected input, relaunching"),
                }
            }
        }

        let mut decoder = match decoder {
            Some(decoder) => decoder,
            None => {
                let args = self.launch_args(
                    family,
                    &model_path,
                    &generation,
                    family.supports_interactive(),
                    &initial_prompt,
                );
                info!(
                    engine = family.name(),
                    profile = ?profile.kind,
                    model = %model_path.display(),
                    "launching chat process"
                );
                slot.process
                    .launch(LaunchSpec {
                        executable: family.executable(&self.config),
                        args,
                        model_path: model_path.clone(),
                        prompt: initial_prompt.clone(),
                    })
                    .await?;
                StreamDecoder::new(initial_prompt, profile.echo_boundary)
            }
        };

        let mut detector = StopDetector::new(markers, generation.max_tokens);
        let outcome = self
            .generate(&mut slot.process, &mut decoder, &mut detector, &sink)
            .await;
        let reason = settle(&mut slot.process, outcome).await?;

        let completion = Completion::new(detector.into_state(), reason, prompt_tokens);
        slot.memo = Some(RequestMemo::chat_turn(&prior, &last, completion.text.clone()));
        info!(
            completion_tokens = completion.usage.completion_tokens,
            reason = ?reason,
            "chat turn finished"
        );

        let _ = sink.send(GenerationEvent::Finished(completion.clone())).await;
        Ok(completion)
    }

    // ==================== Completions ====================

    /// Complete a raw prompt in a freshly launched llama.cpp process
    pub async fn complete(
        &self,
        request: CompletionRequest,
        sink: mpsc::Sender<GenerationEvent>,
    ) -> Result<Completion> {
        if request.prompt.is_empty() {
            return Err(HerdError::InvalidRequest("prompt must not be empty".to_string()));
        }

        let mut stop: Vec<String> = request.stop.into_iter().filter(|s| !s.is_empty()).collect();
        if stop.is_empty() {
            stop.push(DEFAULT_COMPLETION_STOP.to_string());
        }

        let family = EngineFamily::LlamaCpp;
        let generation = GenerationConfig::llama_cpp()
            .apply_request(request.temperature, request.max_tokens, request.top_p)
            .with_repeat_penalty(COMPLETION_REPEAT_PENALTY)
            .with_stop(stop.clone());
        let prompt_tokens = estimate_tokens(&request.prompt);

        let _guard = self.gate.acquire().await;
        let mut slot = self.slot.lock().await;
        let slot = &mut *slot;
        slot.memo = None;

        let args = self.launch_args(family, &request.model_path, &generation, false, &request.prompt);
        info!(model = %request.model_path.display(), "launching completion process");
        slot.process
            .launch(LaunchSpec {
                executable: family.executable(&self.config),
                args,
                model_path: request.model_path.clone(),
                prompt: request.prompt.clone(),
            })
            .await?;

        let mut decoder = StreamDecoder::new(request.prompt.clone(), EchoBoundary::PromptLength);
        let mut detector = StopDetector::new(stop, generation.max_tokens);
        let outcome = self
            .generate(&mut slot.process, &mut decoder, &mut detector, &sink)
            .await;
        let reason = settle(&mut slot.process, outcome).await?;

        let completion = Completion::new(detector.into_state(), reason, prompt_tokens);
        slot.memo = Some(RequestMemo::Completion {
            prompt: request.prompt,
        });
        info!(
            completion_tokens = completion.usage.completion_tokens,
            "completion finished"
        );

        let _ = sink.send(GenerationEvent::Finished(completion.clone())).await;
        Ok(completion)
    }

    // ==================== Embeddings ====================

    /// Run the llama.cpp `embedding` binary once per input
    pub async fn embed(&self, request: EmbeddingRequest) -> Result<Embeddings> {
        if request.input.is_empty() {
            return Err(HerdError::InvalidRequest("input must not be empty".to_string()));
        }

        let executable = self.config.llama_dir.join("embedding");
        let prompt_tokens = request.input.iter().map(|s| estimate_tokens(s)).sum();

        let _guard = self.gate.acquire().await;
        let mut slot = self.slot.lock().await;
        let slot = &mut *slot;
        slot.memo = None;

        let mut vectors = Vec::with_capacity(request.input.len());
        for input in &request.input {
            let mut args = vec![
                "-m".to_string(),
                request.model_path.to_string_lossy().into_owned(),
            ];
            args.extend(self.config.engine_args.iter().cloned());
            args.extend(["-p".to_string(), input.clone()]);

            let process = slot
                .process
                .launch(LaunchSpec {
                    executable: executable.clone(),
                    args,
                    model_path: request.model_path.clone(),
                    prompt: input.clone(),
                })
                .await?;

            let mut output = String::new();
            loop {
                match tokio::time::timeout(self.config.stall_timeout, process.recv()).await {
                    Ok(Some(chunk)) => output.push_str(&chunk),
                    Ok(None) => break,
                    Err(_) => {
                        slot.process.shutdown().await;
                        return Err(HerdError::Stalled { nudges: 0 });
                    }
                }
            }

            let (code, stderr) = process.exit_report().await;
            let vector = match parse_embedding(&output) {
                Ok(vector) => vector,
                Err(_) if code.map_or(false, |c| c != 0) => {
                    return Err(HerdError::ProcessExited { code, stderr });
                }
                Err(e) => return Err(e),
            };
            debug!(dimensions = vector.len(), "embedding computed");
            vectors.push(vector);
        }
        slot.process.shutdown().await;

        slot.memo = Some(RequestMemo::Embedding {
            input: request.input,
        });
        Ok(Embeddings {
            vectors,
            usage: Usage::new(prompt_tokens, 0),
        })
    }

    // ==================== Internals ====================

    fn launch_args(
        &self,
        family: EngineFamily,
        model_path: &Path,
        generation: &GenerationConfig,
        interactive: bool,
        prompt: &str,
    ) -> Vec<String> {
        let mut args = vec!["-m".to_string(), model_path.to_string_lossy().into_owned()];
        args.extend(generation.to_args(family));

        if family == EngineFamily::LlamaCpp {
            if interactive {
                args.push("--interactive".to_string());
            }
            let sets_threads = self
                .config
                .engine_args
                .iter()
                .any(|a| a == "-t" || a == "--threads");
            if !sets_threads {
                args.extend(["--threads".to_string(), self.config.threads.to_string()]);
            }
            args.extend(self.config.engine_args.iter().cloned());
        }

        args.extend(["-p".to_string(), prompt.to_string()]);
        args
    }

    /// Pump process output through the decoder and the stop detector until
    /// the turn ends.
    ///
    /// The stall watchdog is armed once generated text is flowing: each quiet
    /// `stall_timeout` writes a newline to the process, and the request fails
    /// after `stall_nudge_limit` nudges in a row without output.
    async fn generate(
        &self,
        manager: &mut ProcessManager,
        decoder: &mut StreamDecoder,
        detector: &mut StopDetector,
        sink: &mpsc::Sender<GenerationEvent>,
    ) -> Result<StopReason> {
        let process = manager.current().ok_or(HerdError::ProcessExited {
            code: None,
            stderr: String::new(),
        })?;
        let mut nudges = 0u32;

        loop {
            let next = if decoder.state() == DecoderState::Streaming {
                tokio::time::timeout(self.config.stall_timeout, process.recv()).await
            } else {
                Ok(process.recv().await)
            };

            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) if decoder.state() == DecoderState::Streaming => {
                    debug!("process output closed after generation started");
                    return Ok(StopReason::EndOfStream);
                }
                Ok(None) => {
                    let (code, stderr) = process.exit_report().await;
                    return Err(HerdError::ProcessExited { code, stderr });
                }
                Err(_) => {
                    if nudges >= self.config.stall_nudge_limit {
                        return Err(HerdError::Stalled { nudges });
                    }
                    nudges += 1;
                    warn!(
                        nudges,
                        quiet = ?self.config.stall_timeout,
                        "inference process unresponsive, attempting to resume generation"
                    );
                    process.feed("\n").await?;
                    continue;
                }
            };

            let Some(delta) = decoder.push(&chunk) else {
                continue;
            };
            nudges = 0;

            match detector.inspect(&delta) {
                Decision::Stop(reason) => return Ok(reason),
                Decision::Continue => {
                    if sink.send(GenerationEvent::Delta(delta)).await.is_err() {
                        return Err(HerdError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Leave the process in the right state for how the turn ended
async fn settle(manager: &mut ProcessManager, outcome: Result<StopReason>) -> Result<StopReason> {
    match outcome {
        Ok(StopReason::EndOfStream) => Ok(StopReason::EndOfStream),
        Ok(reason) => {
            manager.interrupt();
            Ok(reason)
        }
        Err(HerdError::Cancelled) => {
            info!("client went away, interrupting generation");
            manager.interrupt();
            Err(HerdError::Cancelled)
        }
        Err(e) => {
            error!(error = %e, "generation failed");
            manager.shutdown().await;
            Err(e)
        }
    }
}

/// Whitespace-separated floats printed by the `embedding` binary
pub fn parse_embedding(output: &str) -> Result<Vec<f32>> {
    let clean = strip_ansi_codes(output);
    let values = clean
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f32>()
                .map_err(|_| HerdError::MalformedOutput(format!("not a number: {:?}", token)))
        })
        .collect::<Result<Vec<f32>>>()?;

    if values.is_empty() {
        return Err(HerdError::MalformedOutput("no embedding values".to_string()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeEngines};
    use std::time::Duration;

    async fn run_chat(herd: &Herd, request: ChatRequest) -> (Result<Completion>, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = herd.chat(request, tx).await;
        let mut deltas = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let GenerationEvent::Delta(delta) = event {
                deltas.push(delta);
            }
        }
        (result, deltas)
    }

    fn first_turn() -> Vec<Message> {
        vec![Message::system("You are helpful."), Message::user("Hi")]
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_parse_embedding() {
        assert_eq!(parse_embedding("0.5 -1 2e-1 \n").unwrap(), vec![0.5, -1.0, 0.2]);
        assert!(matches!(parse_embedding(""), Err(HerdError::MalformedOutput(_))));
        assert!(matches!(parse_embedding("0.5 nan? 1"), Err(HerdError::MalformedOutput(_))));
    }

    #[test]
    fn test_missing_model_path() {
        let herd = Herd::new(ServerConfig::default());
        assert!(matches!(herd.resolve_model_path(None), Err(HerdError::Config(_))));
    }

    #[tokio::test]
    async fn test_chat_end_to_end() {
        let engines = FakeEngines::new();
        engines.install("main", testing::CHATTY_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (result, deltas) = run_chat(&herd, ChatRequest::new(&model, first_turn())).await;
        let completion = result.unwrap();

        assert_eq!(completion.text, "Hello there");
        assert_eq!(deltas, vec!["Hello", " there"]);
        assert_eq!(completion.finish_reason, "stop");

        let profile = PromptProfile::for_model(&model);
        let prompt = profile.initial_prompt(&first_turn()[..1], &first_turn()[1..]);
        assert_eq!(completion.usage.prompt_tokens, (prompt.chars().count() + 3) / 4);
        assert_eq!(completion.usage.completion_tokens, 2);

        let args = engines.args_log();
        assert!(args.contains("--interactive"));
        assert!(args.contains("--reverse-prompt user:"));
        assert!(!herd.gate.is_busy());
    }

    #[tokio::test]
    async fn test_chat_continues_warm_process() {
        let engines = FakeEngines::new();
        engines.install("main", testing::CHATTY_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (first, _) = run_chat(&herd, ChatRequest::new(&model, first_turn())).await;
        let reply = first.unwrap().text;

        let mut messages = first_turn();
        messages.push(Message::assistant(format!("  {}\n", reply)));
        messages.push(Message::user("Next"));
        let (second, deltas) = run_chat(&herd, ChatRequest::new(&model, messages)).await;

        assert_eq!(second.unwrap().text, "Again");
        assert_eq!(deltas, vec!["Again"]);
        assert_eq!(engines.launches(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_chat_relaunches() {
        let engines = FakeEngines::new();
        engines.install("main", testing::CHATTY_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        run_chat(&herd, ChatRequest::new(&model, first_turn())).await.0.unwrap();

        let messages = vec![
            Message::system("You are helpful."),
            Message::user("Hi"),
            Message::assistant("Something else entirely"),
            Message::user("Next"),
        ];
        let (second, _) = run_chat(&herd, ChatRequest::new(&model, messages)).await;
        assert_eq!(second.unwrap().text, "Hello there");
        assert_eq!(engines.launches(), 2);
    }

    #[tokio::test]
    async fn test_ggml_models_never_continue() {
        let engines = FakeEngines::new();
        engines.install("gpt-2", testing::CHATTY_MAIN);
        let herd = Herd::new(engines.config());
        let model = PathBuf::from("/models/gpt-2-117M/ggml-model.bin");

        let first = run_chat(&herd, ChatRequest::new(&model, first_turn())).await.0.unwrap();
        let mut messages = first_turn();
        messages.push(Message::assistant(first.text));
        messages.push(Message::user("Next"));
        run_chat(&herd, ChatRequest::new(&model, messages)).await.0.unwrap();

        assert_eq!(engines.launches(), 2);
        let args = engines.args_log();
        assert!(!args.contains("--interactive"));
        assert!(!args.contains("--reverse-prompt"));
        assert!(args.contains("--temp 0.8"));
    }

    #[tokio::test]
    async fn test_token_budget_ends_turn() {
        let engines = FakeEngines::new();
        engines.install("main", testing::CHATTY_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let mut request = ChatRequest::new(&model, first_turn());
        request.max_tokens = Some(2);
        let (result, deltas) = run_chat(&herd, request).await;
        let completion = result.unwrap();
        assert_eq!(completion.text, "Hello");
        assert_eq!(deltas, vec!["Hello"]);
        assert!(engines.args_log().contains("--n_predict 2"));
    }

    #[tokio::test]
    async fn test_watchdog_nudges_stalled_process() {
        let engines = FakeEngines::new();
        engines.install("main", testing::STALLING_MAIN);
        let config = engines.config().with_stall_timeout(Duration::from_millis(300));
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (result, _) = run_chat(&herd, ChatRequest::new(&model, first_turn())).await;
        assert_eq!(result.unwrap().text, "Hello");
    }

    #[tokio::test]
    async fn test_watchdog_gives_up() {
        let engines = FakeEngines::new();
        engines.install("main", testing::SILENT_MAIN);
        let mut config = engines.config().with_stall_timeout(Duration::from_millis(100));
        config.stall_nudge_limit = 2;
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (result, deltas) = run_chat(&herd, ChatRequest::new(&model, first_turn())).await;
        assert!(matches!(result, Err(HerdError::Stalled { nudges: 2 })));
        assert_eq!(deltas, vec!["Hel"]);
        assert!(!herd.gate.is_busy());
    }

    #[tokio::test]
    async fn test_exit_before_echo_is_an_error() {
        let engines = FakeEngines::new();
        engines.install("main", testing::BROKEN_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (result, _) = run_chat(&herd, ChatRequest::new(&model, first_turn())).await;
        match result {
            Err(HerdError::ProcessExited { code, stderr }) => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("failed to load model"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exit_after_echo_finishes_turn() {
        let engines = FakeEngines::new();
        engines.install("main", testing::SHORT_LIVED_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (result, _) = run_chat(&herd, ChatRequest::new(&model, first_turn())).await;
        let completion = result.unwrap();
        assert_eq!(completion.text, " world!");
        assert_eq!(completion.finish_reason, "stop");
    }

    #[tokio::test]
    async fn test_closed_sink_cancels() {
        let engines = FakeEngines::new();
        engines.install("main", testing::CHATTY_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = herd.chat(ChatRequest::new(&model, first_turn()), tx).await;
        assert!(matches!(result, Err(HerdError::Cancelled)));
        assert!(!herd.gate.is_busy());
        assert!(herd.slot.lock().await.memo.is_none());
    }

    #[tokio::test]
    async fn test_completion() {
        let engines = FakeEngines::new();
        engines.install("main", testing::SHORT_LIVED_MAIN);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let mut request = CompletionRequest::new(&model, "Hello");
        request.stop = vec!["!".to_string()];
        let (tx, _rx) = mpsc::channel(64);
        let completion = herd.complete(request, tx).await.unwrap();

        assert_eq!(completion.text, " world");
        assert_eq!(completion.usage.prompt_tokens, 2);
        let args = engines.args_log();
        assert!(args.contains("--repeat_penalty 1.3"));
        assert!(args.contains("--reverse-prompt !"));
        assert!(!args.contains("--interactive"));
        assert_eq!(
            herd.slot.lock().await.memo,
            Some(RequestMemo::Completion { prompt: "Hello".to_string() })
        );
    }

    #[tokio::test]
    async fn test_empty_completion_prompt_rejected() {
        let herd = Herd::new(ServerConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        let result = herd.complete(CompletionRequest::new("/m.bin", ""), tx).await;
        assert!(matches!(result, Err(HerdError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_embeddings() {
        let engines = FakeEngines::new();
        engines.install("embedding", testing::EMBEDDING);
        let config = engines.config();
        let model = config.model_path.clone().unwrap();
        let herd = Herd::new(config);

        let embeddings = herd
            .embed(EmbeddingRequest {
                model_path: model,
                input: vec!["first".to_string(), "second".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(embeddings.vectors, vec![vec![0.25, -1.5, 3.0]; 2]);
        assert_eq!(engines.launches(), 2);
        assert!(matches!(
            herd.slot.lock().await.memo,
            Some(RequestMemo::Embedding { .. })
        ));
    }
}
