use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::api::error::ErrorKind;
use crate::api::handler_utils::{
    error_response_with_details, internal_error, into_json, no_files_error, validation_error,
};
use crate::api::server::AppState;
use crate::pipeline::execution::ARCHIVE_FILE_NAME;
use crate::pipeline::preview::{PreviewEntry, PreviewError};
use crate::pipeline::runtime::{MacroBatchRequest, MacroBatchResult, MacroRuntimeError};
use crate::pipeline::{MacroParams, UploadedFile};

pub const MACRO_ERRORS_HEADER: &str = "x-macro-errors";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacroForm {
    pub files: Vec<UploadedFile>,
    pub execute_macro: bool,
    pub macro_script: String,
    pub params: MacroParams,
}

#[derive(Debug, Clone, Serialize)]
struct PreviewResponse {
    results: Vec<PreviewEntry>,
}

pub async fn upload_image_handler(State(state): State<AppState>, multipart: Multipart) -> Response {
    let form = match read_macro_form(multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };
    let names = form
        .files
        .iter()
        .map(|file| file.file_name.as_str())
        .collect::<Vec<_>>();
    info!(files = ?names, "received upload");
    if form.files.is_empty() {
        return no_files_error().into_response();
    }

    if form.execute_macro && !form.macro_script.trim().is_empty() {
        return run_macro_batch(state, form).await;
    }

    match state.preview_generator.preview(form.files).await {
        Ok(results) => (StatusCode::OK, into_json(PreviewResponse { results })).into_response(),
        Err(PreviewError::NoInputFiles) => {
            no_files_error().into_response()
        }
        Err(preview_error) => {
            internal_error(format!("preview failed: {preview_error}")).into_response()
        }
    }
}

pub async fn execute_macro_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Response {
    let form = match read_macro_form(multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };
    if form.files.is_empty() {
        return no_files_error().into_response();
    }
    run_macro_batch(state, form).await
}

async fn run_macro_batch(state: AppState, form: MacroForm) -> Response {
    let orchestrator = state.macro_orchestrator.clone();
    let request = MacroBatchRequest {
        files: form.files,
        script: form.macro_script,
        params: form.params,
    };
    let result = tokio::task::spawn_blocking(move || orchestrator.execute(request)).await;

    match result {
        Ok(Ok(batch)) => archive_response(batch).await,
        Ok(Err(runtime_error)) => map_runtime_error(runtime_error),
        Err(join_error) => {
            internal_error(format!("macro execution task failed: {join_error}")).into_response()
        }
    }
}

async fn archive_response(batch: MacroBatchResult) -> Response {
    let file = match tokio::fs::File::open(batch.archive.path.as_path()).await {
        Ok(file) => file,
        Err(open_error) => {
            error!(archive = %batch.archive.path.display(), error = %open_error, "archive vanished before streaming");
            return error_response_with_details(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Infra,
                "archive_failed",
                "Failed to create zip file",
                None,
            )
            .into_response();
        }
    };
    for entry in &batch.error_log {
        warn!(entry = %entry, "per-file macro error");
    }

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=results.zip"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(batch.archive.size));
    headers.insert(
        MACRO_ERRORS_HEADER,
        HeaderValue::from(batch.error_log.len() as u64),
    );
    info!(
        archive = ARCHIVE_FILE_NAME,
        size = batch.archive.size,
        members = batch.archive.members.len(),
        failed = batch.error_log.len(),
        "streaming archive"
    );
    response
}

fn map_runtime_error(runtime_error: MacroRuntimeError) -> Response {
    match runtime_error {
        MacroRuntimeError::NoInputFiles => {
            no_files_error().into_response()
        }
        MacroRuntimeError::NoOutputs { error_log } => error_response_with_details(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Infra,
            "no_outputs",
            "No output files were generated.",
            Some(json!({ "errors": error_log })),
        )
        .into_response(),
        MacroRuntimeError::Archive { source, error_log } => error_response_with_details(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Infra,
            "archive_failed",
            format!("Failed to create zip file: {source}"),
            Some(json!({ "errors": error_log })),
        )
        .into_response(),
        MacroRuntimeError::Workspace(io_error) => {
            internal_error(format!("batch workspace failed: {io_error}")).into_response()
        }
    }
}

/// Reads the shared multipart shape of both macro endpoints. Unknown fields
/// are ignored; a file part with no name and no bytes (an empty file input)
/// is skipped.
pub async fn read_macro_form(mut multipart: Multipart) -> Result<MacroForm, Response> {
    let mut form = MacroForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(multipart_error) => {
                return Err(validation_error(
                    "invalid_multipart",
                    format!("invalid multipart body: {multipart_error}"),
                )
                .into_response())
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        if name == "files" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(|read_error| {
                validation_error("invalid_multipart", format!("failed to read upload: {read_error}"))
                    .into_response()
            })?;
            if file_name.is_empty() && bytes.is_empty() {
                continue;
            }
            form.files.push(UploadedFile::new(file_name, bytes.to_vec()));
            continue;
        }

        let value = field.text().await.map_err(|read_error| {
            validation_error("invalid_multipart", format!("failed to read field {name}: {read_error}"))
                .into_response()
        })?;
        apply_form_field(&mut form, name.as_str(), value.as_str())
            .map_err(|message| validation_error("invalid_field", message).into_response())?;
    }
    Ok(form)
}

fn apply_form_field(form: &mut MacroForm, name: &str, value: &str) -> Result<(), String> {
    let value = value.trim();
    match name {
        "execute_macro" => form.execute_macro = parse_form_bool(value),
        "macro_script" => form.macro_script = value.to_string(),
        "min_size" => form.params.min_size = parse_bound(name, value)?,
        "max_size" => {
            form.params.max_size = if value.is_empty() || value.eq_ignore_ascii_case("infinity") {
                None
            } else {
                Some(parse_bound(name, value)?)
            }
        }
        "min_circularity" => form.params.min_circularity = parse_bound(name, value)?,
        "max_circularity" => form.params.max_circularity = parse_bound(name, value)?,
        _ => {}
    }
    Ok(())
}

fn parse_form_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_bound(name: &str, value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .ok_or_else(|| format!("Field '{name}' must be a number"))
}
