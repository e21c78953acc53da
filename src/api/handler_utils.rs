use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::api::error::ErrorKind;

pub type ApiObject<T> = (StatusCode, Json<T>);

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
    error_kind: ErrorKind,
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

pub fn error_response(
    status: StatusCode,
    kind: ErrorKind,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ApiObject<Value> {
    error_response_with_details(status, kind, code, message, None)
}

pub fn error_response_with_details(
    status: StatusCode,
    kind: ErrorKind,
    code: impl Into<String>,
    message: impl Into<String>,
    details: Option<Value>,
) -> ApiObject<Value> {
    (
        status,
        into_json(ErrorResponse {
            ok: false,
            error: message.into(),
            error_kind: kind,
            error_code: code.into(),
            details,
        }),
    )
}

pub fn validation_error(code: impl Into<String>, message: impl Into<String>) -> ApiObject<Value> {
    error_response(StatusCode::BAD_REQUEST, ErrorKind::Validation, code, message)
}

/// Both macro endpoints reject an upload with no files the same way.
pub fn no_files_error() -> ApiObject<Value> {
    validation_error("no_files", "No files uploaded")
}

pub fn internal_error(message: impl Into<String>) -> ApiObject<Value> {
    let detail = message.into();
    error!(detail = %detail, "internal api error");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Infra,
        "internal_error",
        "Internal server error",
    )
}

pub fn into_json(payload: impl Serialize) -> Json<Value> {
    Json(serde_json::to_value(payload).unwrap_or_else(|serialize_error| {
        error!(error = %serialize_error, "api payload failed to serialize");
        json!({ "ok": false, "error": "Internal server error" })
    }))
}
