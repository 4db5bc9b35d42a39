//! Registry statistics

use serde::Serialize;

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_sessions: usize,
    pub tenants: Vec<TenantConnectionStats>,
}

/// Tenant-specific connection statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantConnectionStats {
    pub tenant_id: String,
    pub sessions: usize,
}
