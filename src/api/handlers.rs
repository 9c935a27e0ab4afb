use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::types::*;
use crate::runtime::{ChatRequest, Completion, CompletionRequest, EmbeddingRequest, GenerationEvent};
use crate::{Herd, HerdError};

/// Shared server state
pub type SharedState = Arc<Herd>;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Buffered events between a generation task and its HTTP response
const EVENT_BUFFER: usize = 64;

/// Status code and OpenAI error `type` for a runtime error
pub fn classify(err: &HerdError) -> (StatusCode, &'static str) {
    match err {
        HerdError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
        HerdError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        HerdError::Launch(_) | HerdError::ProcessExited { .. } => {
            (StatusCode::BAD_GATEWAY, "process_error")
        }
        HerdError::Stalled { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
        HerdError::MalformedOutput(_) => (StatusCode::BAD_GATEWAY, "upstream_output_error"),
        HerdError::Io(_) | HerdError::Cancelled => {
            (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    }
}

fn reject(err: HerdError) -> (StatusCode, Json<ApiError>) {
    let (status, kind) = classify(&err);
    (status, Json(ApiError::new(err.to_string(), kind)))
}

/// Request body, with malformed JSON reported as an OpenAI error
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(reject(HerdError::InvalidRequest(rejection.body_text()))),
    }
}

/// The bearer token, which carries the model file path
fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn json_event<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(e) => Event::default().data(
            serde_json::json!({"error": {"message": e.to_string(), "type": "server_error"}})
                .to_string(),
        ),
    }
}

fn error_event(err: &HerdError) -> Event {
    let (_, kind) = classify(err);
    json_event(&ApiError::new(err.to_string(), kind))
}

/// SSE response: one event per generation event, then `[DONE]`
fn sse_response<F>(rx: mpsc::Receiver<GenerationEvent>, mut render: F) -> Response
where
    F: FnMut(GenerationEvent) -> Event + Send + 'static,
{
    let done = futures::stream::once(async { Ok::<_, Infallible>(Event::default().data("[DONE]")) });
    let stream = ReceiverStream::new(rx)
        .map(move |event| Ok::<_, Infallible>(render(event)))
        .chain(done);

    Sse::new(stream)
        .keep_alive(KeepAlive::new())
        .into_response()
}

/// Wait for the final event of a non-streaming request
async fn collect(mut rx: mpsc::Receiver<GenerationEvent>) -> Result<Completion, HerdError> {
    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Delta(_) => {}
            GenerationEvent::Finished(completion) => return Ok(completion),
            GenerationEvent::Failed(err) => return Err(err),
        }
    }
    Err(HerdError::Cancelled)
}

/// Run a driver on its own task so a dropped connection surfaces as a closed
/// channel instead of aborting the driver mid-turn.
fn spawn_generation<F, Fut>(drive: F) -> mpsc::Receiver<GenerationEvent>
where
    F: FnOnce(mpsc::Sender<GenerationEvent>) -> Fut,
    Fut: std::future::Future<Output = crate::Result<Completion>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let run = drive(tx.clone());
    tokio::spawn(async move {
        match run.await {
            Ok(_) => {}
            Err(HerdError::Cancelled) => debug!("generation cancelled by client"),
            Err(err) => {
                warn!(error = %err, "generation failed");
                let _ = tx.send(GenerationEvent::Failed(err)).await;
            }
        }
    });
    rx
}

// ============================================================================
// Chat Completion
// ============================================================================

pub async fn chat_completions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = body(payload)?;
    let model_path = state.resolve_model_path(bearer(&headers)).map_err(reject)?;
    if req.messages.is_empty() {
        return Err(reject(HerdError::InvalidRequest(
            "messages array is empty".to_string(),
        )));
    }

    let request = ChatRequest {
        model_path,
        messages: req.messages,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        top_p: req.top_p,
        stop: req.stop.map(OneOrMany::into_vec).unwrap_or_default(),
    };

    let herd = Arc::clone(&state);
    let rx = spawn_generation(move |tx| async move { herd.chat(request, tx).await });

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = unix_now();
    let model = req.model;

    if req.stream {
        let chunk = move |delta: ChunkDelta, finish_reason: Option<String>| ChatCompletionChunk {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        };
        return Ok(sse_response(rx, move |event| match event {
            GenerationEvent::Delta(content) => json_event(&chunk(
                ChunkDelta {
                    content: Some(content),
                },
                None,
            )),
            GenerationEvent::Finished(completion) => json_event(&chunk(
                ChunkDelta::default(),
                Some(completion.finish_reason),
            )),
            GenerationEvent::Failed(err) => error_event(&err),
        }));
    }

    let completion = collect(rx).await.map_err(reject)?;
    Ok(Json(ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: completion.text,
            },
            finish_reason: completion.finish_reason,
        }],
        usage: completion.usage,
    })
    .into_response())
}

// ============================================================================
// Text Completion
// ============================================================================

pub async fn completions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<TextCompletionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let req = body(payload)?;
    let model_path = state.resolve_model_path(bearer(&headers)).map_err(reject)?;
    if req.prompt.is_empty() {
        return Err(reject(HerdError::InvalidRequest(
            "prompt must not be empty".to_string(),
        )));
    }

    let request = CompletionRequest {
        model_path,
        prompt: req.prompt,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        top_p: req.top_p,
        stop: req.stop.map(OneOrMany::into_vec).unwrap_or_default(),
    };

    let herd = Arc::clone(&state);
    let rx = spawn_generation(move |tx| async move { herd.complete(request, tx).await });

    let id = format!("cmpl-{}", uuid::Uuid::new_v4());
    let created = unix_now();
    let model = req.model;

    let response = move |text: String, finish_reason: Option<String>, usage: Option<_>| {
        TextCompletionResponse {
            id: id.clone(),
            object: "text_completion".to_string(),
            created,
            model: model.clone(),
            choices: vec![TextChoice {
                text,
                index: 0,
                finish_reason,
            }],
            usage,
        }
    };

    if req.stream {
        return Ok(sse_response(rx, move |event| match event {
            GenerationEvent::Delta(text) => json_event(&response(text, None, None)),
            GenerationEvent::Finished(completion) => json_event(&response(
                String::new(),
                Some(completion.finish_reason),
                Some(completion.usage),
            )),
            GenerationEvent::Failed(err) => error_event(&err),
        }));
    }

    let completion = collect(rx).await.map_err(reject)?;
    Ok(Json(response(
        completion.text.trim().to_string(),
        Some(completion.finish_reason),
        Some(completion.usage),
    ))
    .into_response())
}

// ============================================================================
// Embeddings
// ============================================================================

pub async fn embeddings(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<EmbeddingsRequest>, JsonRejection>,
) -> ApiResult<Json<EmbeddingsResponse>> {
    let req = body(payload)?;
    let model_path = state.resolve_model_path(bearer(&headers)).map_err(reject)?;

    let result = state
        .embed(EmbeddingRequest {
            model_path,
            input: req.input.into_vec(),
        })
        .await
        .map_err(reject)?;

    let data = result
        .vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingData {
            object: "embedding".to_string(),
            index,
            embedding,
        })
        .collect();

    Ok(Json(EmbeddingsResponse {
        object: "list".to_string(),
        data,
        model: req.model,
        usage: EmbeddingUsage {
            prompt_tokens: result.usage.prompt_tokens,
            total_tokens: result.usage.total_tokens,
        },
    }))
}

// ============================================================================
// Models
// ============================================================================

pub async fn list_models(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Json<ModelListResponse>> {
    let model_path = state.resolve_model_path(bearer(&headers)).map_err(|err| {
        (
            StatusCode::FORBIDDEN,
            Json(ApiError::new(err.to_string(), "configuration_error")),
        )
    })?;

    let name = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_path.to_string_lossy().into_owned());

    Ok(Json(ModelListResponse {
        object: "list".to_string(),
        data: vec![ModelCard {
            id: "gpt-3.5-turbo".to_string(),
            object: name,
            owned_by: "user".to_string(),
            permission: Vec::new(),
        }],
    }))
}
