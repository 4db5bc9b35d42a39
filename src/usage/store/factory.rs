//! Usage store factory

use std::sync::Arc;

use crate::config::{DatabaseConfig, RedisConfig, UsageConfig};

use super::memory::MemoryUsageStore;
use super::postgres::PostgresUsageStore;
use super::redis::RedisUsageStore;
use super::UsageStore;

/// Create the usage store named by `usage.store_backend`.
///
/// - `"postgres"`: `PostgresUsageStore`, connecting and creating its table
/// - `"redis"`: `RedisUsageStore` with keys under `usage.redis_prefix`
/// - `"memory"` (default): `MemoryUsageStore`
///
/// Any backend that cannot be created falls back to memory with a warning.
pub async fn create_usage_store(
    usage: &UsageConfig,
    redis: &RedisConfig,
    database: &DatabaseConfig,
) -> Arc<dyn UsageStore> {
    match usage.store_backend.as_str() {
        "postgres" => match PostgresUsageStore::connect(database).await {
            Ok(store) => {
                tracing::info!(backend = "postgres", "Creating PostgreSQL usage store");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "PostgreSQL usage store requested but unavailable, falling back to memory"
                );
                Arc::new(MemoryUsageStore::new())
            }
        },
        "redis" => match RedisUsageStore::new(redis, usage.redis_prefix.clone()) {
            Ok(store) => {
                tracing::info!(
                    backend = "redis",
                    prefix = %usage.redis_prefix,
                    "Creating Redis usage store"
                );
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis usage store requested but client could not be created, falling back to memory"
                );
                Arc::new(MemoryUsageStore::new())
            }
        },
        "memory" => {
            tracing::info!(backend = "memory", "Creating in-memory usage store");
            Arc::new(MemoryUsageStore::new())
        }
        other => {
            tracing::warn!(backend = %other, "Unknown usage store backend, falling back to memory");
            Arc::new(MemoryUsageStore::new())
        }
    }
}
