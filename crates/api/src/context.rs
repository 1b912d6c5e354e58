use fieldops_core::{OperatorId, TenantId};

/// Tenant context for a request.
///
/// Set by the upstream auth gateway and required on every tenant-scoped route.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// The operator acting on the request. Only mutating routes require it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    operator_id: OperatorId,
}

impl OperatorContext {
    pub fn new(operator_id: OperatorId) -> Self {
        Self { operator_id }
    }

    pub fn operator_id(&self) -> OperatorId {
        self.operator_id
    }
}
