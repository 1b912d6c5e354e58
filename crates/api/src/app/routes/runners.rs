use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use fieldops_outbox::RunnerHealth;

use crate::app::dto::RunnerHealthQuery;
use crate::app::{errors, services::AppServices};

/// GET /runners/:name/health
///
/// Not tenant-scoped: runners serve every tenant.
pub async fn runner_health(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
    Query(query): Query<RunnerHealthQuery>,
) -> axum::response::Response {
    match services.stores.heartbeats.get_heartbeat(&name).await {
        Ok(Some(beat)) => {
            let health = RunnerHealth::classify(beat, services.clock.now(), query.stale_after());
            (StatusCode::OK, Json(health)).into_response()
        }
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no heartbeat recorded for runner {name}"),
        ),
        Err(e) => errors::outbox_error_to_response(e),
    }
}
