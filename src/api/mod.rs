//! API layer - HTTP endpoint handlers.

mod health;
mod metrics;
mod routes;
mod usage;

pub use health::{health, HealthResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use usage::{system_usage, tenant_usage, SystemUsageResponse, UsageRangeQuery};
