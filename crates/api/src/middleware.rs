use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use fieldops_core::{OperatorId, TenantId};

use crate::app::errors::json_error;
use crate::context::{OperatorContext, TenantContext};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const OPERATOR_HEADER: &str = "x-operator-id";

/// Resolve tenant (required) and operator (optional) identities from gateway headers.
pub async fn tenant_context_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id: TenantId = match header_id(req.headers(), TENANT_HEADER)? {
        Some(id) => id,
        None => {
            return Err(json_error(
                StatusCode::UNAUTHORIZED,
                "missing_tenant",
                format!("{TENANT_HEADER} header is required"),
            ));
        }
    };
    let operator_id: Option<OperatorId> = header_id(req.headers(), OPERATOR_HEADER)?;

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    if let Some(operator_id) = operator_id {
        req.extensions_mut()
            .insert(OperatorContext::new(operator_id));
    }

    Ok(next.run(req).await)
}

fn header_id<T: std::str::FromStr>(
    headers: &HeaderMap,
    name: &'static str,
) -> Result<Option<T>, Response> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };

    let invalid = || {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_header",
            format!("{name} must be a UUID"),
        )
    };

    let value = value.to_str().map_err(|_| invalid())?.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| invalid())
}
