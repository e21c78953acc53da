use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use atlas_backend_core::api::server::{build_router_with_state, AppState};
use atlas_backend_core::config::LlmConfig;
use atlas_backend_core::generation::prompts::PROMPT_IMPROVEMENT_SYSTEM;
use atlas_backend_core::llm::{CompletionBackend, CompletionRequest, LlmError};
use atlas_backend_core::pipeline::preview::{PreviewEntry, PreviewError, PreviewGenerator};
use atlas_backend_core::pipeline::runtime::{
    MacroBatchRequest, MacroBatchResult, MacroOrchestrator, MacroRuntimeError,
};
use atlas_backend_core::pipeline::UploadedFile;

const MACRO_DELTAS: [&str; 3] = [
    "[DESCRIPTION]\nInverts the image.\n",
    "```ijm\nrun(\"Invert\");\n",
    "```\n[EXPLANATION]\nUses the Invert command.",
];
const IMPROVED_DELTAS: [&str; 2] = ["Invert every ", "uploaded image."];

struct ScriptedBackend {
    fail_generation: bool,
    requests: Mutex<Vec<CompletionRequest>>,
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream(
        &self,
        request: CompletionRequest,
        delta_tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        let improving = request.system == PROMPT_IMPROVEMENT_SYSTEM;
        self.requests
            .lock()
            .expect("requests lock should not be poisoned")
            .push(request);
        if improving {
            for delta in IMPROVED_DELTAS {
                if delta_tx.send(delta.to_string()).await.is_err() {
                    return Ok(());
                }
            }
            return Ok(());
        }
        if self.fail_generation {
            let _ = delta_tx.send(String::from("[DESCRIPTION]\nPartial")).await;
            return Err(LlmError::ApiError {
                status: 529,
                message: String::from("overloaded"),
            });
        }
        for delta in MACRO_DELTAS {
            if delta_tx.send(delta.to_string()).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

struct IdleOrchestrator;

impl MacroOrchestrator for IdleOrchestrator {
    fn execute(&self, _request: MacroBatchRequest) -> Result<MacroBatchResult, MacroRuntimeError> {
        Err(MacroRuntimeError::NoInputFiles)
    }
}

struct IdlePreview;

#[async_trait]
impl PreviewGenerator for IdlePreview {
    async fn preview(&self, _files: Vec<UploadedFile>) -> Result<Vec<PreviewEntry>, PreviewError> {
        Err(PreviewError::NoInputFiles)
    }
}

fn test_app(fail_generation: bool) -> (Router, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend {
        fail_generation,
        requests: Mutex::new(Vec::new()),
    });
    let state = AppState::new(
        Arc::new(IdleOrchestrator),
        Arc::new(IdlePreview),
        backend.clone(),
        LlmConfig::default(),
    );
    (build_router_with_state(state), backend)
}

async fn get(app: Router, uri: &str) -> axum::response::Response {
    app.oneshot(
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build"),
    )
    .await
    .expect("request should succeed")
}

async fn sse_events(response: axum::response::Response) -> Vec<(String, Value)> {
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    String::from_utf8(bytes.to_vec())
        .expect("stream should be utf8")
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| {
            let envelope: Value = serde_json::from_str(data).expect("event should be json");
            let name = envelope["event"]
                .as_str()
                .expect("event name should exist")
                .to_string();
            (name, envelope["data"].clone())
        })
        .collect()
}

#[tokio::test]
async fn generate_macro_streams_sections_then_completes() {
    let (app, backend) = test_app(false);

    let response = get(app, "/api/v1/stream-generate-macro?input=invert%20cells").await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(response).await;

    let names = events.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "message",
            "section_change",
            "message",
            "section_change",
            "message",
            "section_change",
            "complete"
        ]
    );
    let section_changes = events
        .iter()
        .filter(|(name, _)| name == "section_change")
        .map(|(_, data)| data.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        section_changes,
        vec![
            json!({ "section": "description", "content": "Inverts the image." }),
            json!({
                "section": "script",
                "content": "// Generated ImageJ Macro\nrun(\"Invert\");"
            }),
            json!({ "section": "explanation", "content": "Uses the Invert command." }),
        ]
    );
    assert_eq!(
        events.last().map(|(_, data)| data.clone()),
        Some(json!({ "message": "Macro generation complete" }))
    );

    let requests = backend
        .requests
        .lock()
        .expect("requests lock should not be poisoned");
    assert_eq!(requests.len(), 1);
    assert!(requests[0].user.contains("invert cells"));
}

#[tokio::test]
async fn generate_macro_with_improvement_uses_improved_prompt_silently() {
    let (app, backend) = test_app(false);

    let response = get(
        app,
        "/api/v1/stream-generate-macro?input=invert&improve_prompt=true",
    )
    .await;
    let events = sse_events(response).await;

    assert!(events
        .iter()
        .all(|(name, _)| !name.starts_with("improved_prompt")));
    assert_eq!(events.last().map(|(name, _)| name.as_str()), Some("complete"));

    let requests = backend
        .requests
        .lock()
        .expect("requests lock should not be poisoned");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].system, PROMPT_IMPROVEMENT_SYSTEM);
    assert!(requests[1].user.contains("Invert every uploaded image."));
}

#[tokio::test]
async fn generate_macro_failure_ends_with_single_error() {
    let (app, _) = test_app(true);

    let response = get(app, "/api/v1/stream-generate-macro?input=invert").await;
    let events = sse_events(response).await;

    let errors = events
        .iter()
        .filter(|(name, _)| name == "error")
        .collect::<Vec<_>>();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        events.last(),
        Some(&(
            String::from("error"),
            json!({ "error": "API error (529): overloaded" })
        ))
    );
    assert!(events.iter().all(|(name, _)| name != "complete"));
}

#[tokio::test]
async fn generate_macro_requires_input() {
    let (app, backend) = test_app(false);

    let response = get(app, "/api/v1/stream-generate-macro?input=%20%20").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let body: Value = serde_json::from_slice(&bytes).expect("error body should be json");
    assert_eq!(body["error_code"], json!("input_required"));
    assert_eq!(body["error_kind"], json!("validation"));
    assert!(backend
        .requests
        .lock()
        .expect("requests lock should not be poisoned")
        .is_empty());
}

#[tokio::test]
async fn improve_prompt_streams_chunks_then_completes() {
    let (app, _) = test_app(false);

    let response = get(app, "/api/v1/stream-improve-prompt/?input=invert").await;
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_events(response).await;

    assert_eq!(
        events,
        vec![
            (
                String::from("improved_prompt_chunk"),
                json!({ "chunk": "Invert every " })
            ),
            (
                String::from("improved_prompt_chunk"),
                json!({ "chunk": "uploaded image." })
            ),
            (
                String::from("improved_prompt_complete"),
                json!({ "message": "Prompt improvement complete" })
            ),
        ]
    );
}

#[tokio::test]
async fn improve_prompt_requires_input() {
    let (app, _) = test_app(false);

    let response = get(app, "/api/v1/stream-improve-prompt/").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
