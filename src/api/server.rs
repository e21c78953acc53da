use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::LlmConfig;
use crate::llm::SharedCompletionBackend;
use crate::pipeline::preview::SharedPreviewGenerator;
use crate::pipeline::runtime::SharedMacroOrchestrator;

pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service_name: &'static str,
    pub service_version: &'static str,
    pub started_unix_ms: u128,
    pub macro_orchestrator: SharedMacroOrchestrator,
    pub preview_generator: SharedPreviewGenerator,
    pub completion_backend: SharedCompletionBackend,
    pub llm: Arc<LlmConfig>,
}

impl AppState {
    pub fn new(
        macro_orchestrator: SharedMacroOrchestrator,
        preview_generator: SharedPreviewGenerator,
        completion_backend: SharedCompletionBackend,
        llm: LlmConfig,
    ) -> Self {
        Self {
            service_name: "atlas-backend-core",
            service_version: env!("CARGO_PKG_VERSION"),
            started_unix_ms: now_unix_ms(),
            macro_orchestrator,
            preview_generator,
            completion_backend,
            llm: Arc::new(llm),
        }
    }
}

pub fn build_router_with_state(state: AppState) -> Router {
    build_router_with_state_and_cors(state, &[])
}

pub fn build_router_with_state_and_cors(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/v1/upload-image/",
            post(crate::api::macros::upload_image_handler),
        )
        .route(
            "/api/v1/execute-macro/",
            post(crate::api::macros::execute_macro_handler),
        )
        .route(
            "/api/v1/stream-generate-macro",
            get(crate::api::chat::stream_generate_macro_handler),
        )
        .route(
            "/api/v1/stream-improve-prompt/",
            get(crate::api::chat::stream_improve_prompt_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.as_str()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_credentials(true)
}

pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(bind = %addr, "starting atlas-backend-core HTTP surface");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "status": "ok",
            "service": state.service_name,
            "version": state.service_version,
            "started_unix_ms": state.started_unix_ms,
        })),
    )
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
