use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use fieldops_outbox::{OutboxError, ReplayError};

pub fn outbox_error_to_response(err: OutboxError) -> axum::response::Response {
    match err {
        OutboxError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        OutboxError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        OutboxError::LeaseLost(event_id) => json_error(
            StatusCode::CONFLICT,
            "lease_lost",
            format!("lease lost for event {event_id}"),
        ),
        OutboxError::TenantIsolation(msg) => {
            json_error(StatusCode::FORBIDDEN, "tenant_isolation", msg)
        }
        OutboxError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn replay_error_to_response(err: ReplayError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        ReplayError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        ReplayError::TargetMissing { .. } => {
            json_error(StatusCode::GONE, "target_missing", message)
        }
        ReplayError::AlreadyPending(_) => {
            json_error(StatusCode::CONFLICT, "already_pending", message)
        }
        ReplayError::AlreadyDelivered(_) => {
            json_error(StatusCode::CONFLICT, "already_delivered", message)
        }
        ReplayError::Store(e) => outbox_error_to_response(e),
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
