use axum::{routing::get, Router};

use crate::server::AppState;

use super::usage::{system_usage, tenant_usage};

/// Routes mounted under `/api/v1`.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/tenants/{tenant_id}/usage", get(tenant_usage))
        .route("/system/usage", get(system_usage))
}
