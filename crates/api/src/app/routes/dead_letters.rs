//! Dead-letter triage and operator replay.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::dto::{DeadLetterListQuery, parse_dead_letter_id};
use crate::app::{errors, services::AppServices};
use crate::context::{OperatorContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id", get(get_dead_letter))
        .route("/:id/replay", post(replay_dead_letter))
        .route("/:id/audit", get(dead_letter_audit))
}

/// GET /dead-letters
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<DeadLetterListQuery>,
) -> axum::response::Response {
    match services
        .replay
        .list(tenant.tenant_id(), &query.filter(), query.pagination())
        .await
    {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::outbox_error_to_response(e),
    }
}

/// GET /dead-letters/:id
pub async fn get_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_dead_letter_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.replay.get(tenant.tenant_id(), id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dead letter {id} not found"),
        ),
        Err(e) => errors::outbox_error_to_response(e),
    }
}

/// POST /dead-letters/:id/replay
///
/// Requires `x-operator-id`; the operator is stamped on the dead letter and
/// the audit trail.
pub async fn replay_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    operator: Option<Extension<OperatorContext>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Some(Extension(operator)) = operator else {
        return errors::json_error(
            StatusCode::UNAUTHORIZED,
            "missing_operator",
            "x-operator-id header is required to replay",
        );
    };
    let id = match parse_dead_letter_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .replay
        .replay(tenant.tenant_id(), id, operator.operator_id())
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::replay_error_to_response(e),
    }
}

/// GET /dead-letters/:id/audit
pub async fn dead_letter_audit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_dead_letter_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.replay.audit_trail(tenant.tenant_id(), id).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => errors::outbox_error_to_response(e),
    }
}
