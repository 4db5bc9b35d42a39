//! Tenant-scoped registry of live dashboard sessions.

mod registry;
mod stats;
mod types;

pub use registry::{Registration, SendError, TenantConnectionRegistry};
pub use stats::{ConnectionStats, TenantConnectionStats};
pub use types::{DeliveryReport, Session, TransportError};
