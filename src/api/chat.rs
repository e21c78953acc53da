use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::api::handler_utils::validation_error;
use crate::api::server::AppState;
use crate::api::stream::{event_stream_response, Delivery, EventSink, StreamEnvelope};
use crate::config::LlmConfig;
use crate::generation::{macro_generation_request, prompt_improvement_request, SectionParser};
use crate::llm::{CompletionRequest, LlmError, SharedCompletionBackend};

pub const PROMPT_IMPROVEMENT_COMPLETE_MESSAGE: &str = "Prompt improvement complete";
const DELTA_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateMacroQuery {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub improve_prompt: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImprovePromptQuery {
    #[serde(default)]
    pub input: String,
}

pub async fn stream_generate_macro_handler(
    State(state): State<AppState>,
    Query(query): Query<GenerateMacroQuery>,
) -> Response {
    if query.input.trim().is_empty() {
        return validation_error("input_required", "Query parameter 'input' is required")
            .into_response();
    }
    info!(improve_prompt = query.improve_prompt, "macro generation requested");
    let backend = state.completion_backend.clone();
    let llm = state.llm.clone();
    event_stream_response(move |sink| {
        run_macro_generation(backend, llm, query.input, query.improve_prompt, sink)
    })
    .into_response()
}

pub async fn stream_improve_prompt_handler(
    State(state): State<AppState>,
    Query(query): Query<ImprovePromptQuery>,
) -> Response {
    if query.input.trim().is_empty() {
        return validation_error("input_required", "Query parameter 'input' is required")
            .into_response();
    }
    info!("prompt improvement requested");
    let backend = state.completion_backend.clone();
    let llm = state.llm.clone();
    event_stream_response(move |sink| run_prompt_improvement(backend, llm, query.input, sink))
        .into_response()
}

/// Drives one macro generation: optional silent prompt improvement, then the
/// completion stream through a [`SectionParser`]. Stops without further
/// events when the client disconnects.
pub async fn run_macro_generation(
    backend: SharedCompletionBackend,
    llm: Arc<LlmConfig>,
    input: String,
    improve_prompt: bool,
    sink: EventSink,
) {
    let task = if improve_prompt {
        match collect_improved_prompt(&backend, llm.as_ref(), input.as_str(), &sink).await {
            Ok(Some(improved)) if !improved.trim().is_empty() => improved,
            Ok(Some(_)) => input,
            Ok(None) => return,
            Err(llm_error) => {
                error!(error = %llm_error, "prompt improvement failed");
                sink.emit(SectionParser::new().fail(llm_error.to_string()))
                    .await;
                return;
            }
        }
    } else {
        input
    };

    let request = macro_generation_request(task.as_str(), llm.as_ref());
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_CHANNEL_CAPACITY);
    let upstream = spawn_completion(backend, request, delta_tx);

    let mut parser = SectionParser::new();
    while let Some(delta) = delta_rx.recv().await {
        for event in parser.push(delta.as_str()) {
            if sink.emit(event).await == Delivery::Disconnected {
                info!("client disconnected; closing macro stream");
                upstream.abort();
                return;
            }
        }
    }

    match upstream.await {
        Ok(Ok(())) => {
            for event in parser.finish() {
                if sink.emit(event).await == Delivery::Disconnected {
                    return;
                }
            }
        }
        Ok(Err(llm_error)) => {
            error!(error = %llm_error, "macro generation failed");
            sink.emit(parser.fail(llm_error.to_string())).await;
        }
        Err(join_error) => {
            error!(error = %join_error, "completion task failed");
            sink.emit(parser.fail(format!("completion task failed: {join_error}")))
                .await;
        }
    }
}

pub async fn run_prompt_improvement(
    backend: SharedCompletionBackend,
    llm: Arc<LlmConfig>,
    input: String,
    sink: EventSink,
) {
    let request = prompt_improvement_request(input.as_str(), llm.as_ref());
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_CHANNEL_CAPACITY);
    let upstream = spawn_completion(backend, request, delta_tx);

    while let Some(chunk) = delta_rx.recv().await {
        let envelope = StreamEnvelope::new("improved_prompt_chunk", json!({ "chunk": chunk }));
        if sink.emit(envelope).await == Delivery::Disconnected {
            info!("client disconnected; closing prompt stream");
            upstream.abort();
            return;
        }
    }

    let outcome = match upstream.await {
        Ok(result) => result,
        Err(join_error) => Err(LlmError::StreamError(format!(
            "completion task failed: {join_error}"
        ))),
    };
    let closing = match outcome {
        Ok(()) => StreamEnvelope::new(
            "improved_prompt_complete",
            json!({ "message": PROMPT_IMPROVEMENT_COMPLETE_MESSAGE }),
        ),
        Err(llm_error) => {
            error!(error = %llm_error, "prompt improvement failed");
            StreamEnvelope::error(llm_error.to_string())
        }
    };
    sink.emit(closing).await;
}

/// Collects the whole improved prompt. `Ok(None)` means the client left
/// while it was being produced.
async fn collect_improved_prompt(
    backend: &SharedCompletionBackend,
    llm: &LlmConfig,
    input: &str,
    sink: &EventSink,
) -> Result<Option<String>, LlmError> {
    let request = prompt_improvement_request(input, llm);
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_CHANNEL_CAPACITY);
    let upstream = spawn_completion(backend.clone(), request, delta_tx);

    let mut improved = String::new();
    while let Some(chunk) = delta_rx.recv().await {
        if sink.is_disconnected() {
            upstream.abort();
            return Ok(None);
        }
        improved.push_str(chunk.as_str());
    }
    match upstream.await {
        Ok(Ok(())) => {
            info!(chars = improved.len(), "improved prompt collected");
            Ok(Some(improved))
        }
        Ok(Err(llm_error)) => Err(llm_error),
        Err(join_error) => Err(LlmError::StreamError(format!(
            "completion task failed: {join_error}"
        ))),
    }
}

fn spawn_completion(
    backend: SharedCompletionBackend,
    request: CompletionRequest,
    delta_tx: mpsc::Sender<String>,
) -> tokio::task::JoinHandle<Result<(), LlmError>> {
    tokio::spawn(async move { backend.stream(request, delta_tx).await })
}
