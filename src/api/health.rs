//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::TenantConnectionStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
    pub broker: BrokerHealthResponse,
    pub usage: UsageHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub tenants: Vec<TenantConnectionStats>,
}

#[derive(Debug, Serialize)]
pub struct BrokerHealthResponse {
    pub backend: String,
    pub active_subscriptions: usize,
    pub dashboard_routes: usize,
}

#[derive(Debug, Serialize)]
pub struct UsageHealthResponse {
    pub store_backend: String,
    pub pending_tenants: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let conn_stats = state.registry.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connections: ConnectionHealthResponse {
            total: conn_stats.total_sessions,
            tenants: conn_stats.tenants,
        },
        broker: BrokerHealthResponse {
            backend: state.broker.backend_name().to_string(),
            active_subscriptions: state.broker.active_subscriptions(),
            dashboard_routes: state.bridge.active_routes().await,
        },
        usage: UsageHealthResponse {
            store_backend: state.store.backend_name().to_string(),
            pending_tenants: state.counters.tenants().len(),
        },
    })
}
