use axum::{Router, routing::get};

pub mod dead_letters;
pub mod runners;
pub mod system;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/backlog", get(system::backlog))
        .nest("/dead-letters", dead_letters::router())
}
