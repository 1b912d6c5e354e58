//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and the shared handler state
//! - `routes/`: HTTP handlers, one file per area
//! - `dto.rs`: query DTOs and path parsing
//! - `errors.rs`: consistent JSON error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, Stores};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    // Tenant-scoped routes: require gateway headers.
    let tenant_scoped = routes::router()
        .layer(axum::middleware::from_fn(
            middleware::tenant_context_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/runners/:name/health", get(routes::runners::runner_health))
        .merge(tenant_scoped)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
