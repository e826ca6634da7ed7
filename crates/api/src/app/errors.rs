use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskforge_core::DomainError;
use taskforge_infra::{CancelError, StoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(e) => domain_error_to_response(e),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn cancel_error_to_response(err: CancelError) -> axum::response::Response {
    match err {
        CancelError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "task not found"),
        e @ CancelError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", e.to_string())
        }
        CancelError::Store(e) => store_error_to_response(e),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::UnknownTaskType(name) => json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("unknown task type: {name}"),
        ),
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "task not found"),
        e @ StoreError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", e.to_string())
        }
        e @ StoreError::AlreadyExists(_) => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "task store failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", "task store unavailable")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
