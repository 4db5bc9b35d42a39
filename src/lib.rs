// Shared infrastructure
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Realtime plane
pub mod auth;
pub mod bridge;
pub mod broker;
pub mod connection_manager;
pub mod websocket;

// Usage metering
pub mod usage;

// Application layer
pub mod api;
pub mod server;
pub mod shutdown;
