use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// "memory" or "redis"
    #[serde(default = "default_memory_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Capacity of each session's outbound queue
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    /// Seconds between aggregator samples
    #[serde(default = "default_collection_interval")]
    pub collection_interval: u64,
    /// Seconds between flushes to the usage store
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// Upper bound in seconds for the flush attempted at shutdown
    #[serde(default = "default_final_flush_timeout")]
    pub final_flush_timeout: u64,
    /// "memory", "redis" or "postgres"
    #[serde(default = "default_memory_backend")]
    pub store_backend: String,
    #[serde(default = "default_usage_prefix")]
    pub redis_prefix: String,
    /// Look-back window used when a usage report omits its start date
    #[serde(default = "default_range_days")]
    pub default_range_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

fn default_channel_buffer() -> usize {
    64
}

fn default_collection_interval() -> u64 {
    10
}

fn default_flush_interval() -> u64 {
    60
}

fn default_final_flush_timeout() -> u64 {
    5
}

fn default_usage_prefix() -> String {
    "ara:usage".to_string()
}

fn default_range_days() -> u32 {
    7
}

fn default_database_url() -> String {
    "postgres://localhost:5432/ara".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ara-control-plane".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("broker.backend", "memory")?
            .set_default("usage.collection_interval", 10)?
            .set_default("usage.flush_interval", 60)?
            .set_default("usage.store_backend", "memory")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SERVER_PORT, JWT_SECRET, BROKER_BACKEND, ... Multi-word keys such as
            // usage.flush_interval are set through the config files.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl UsageConfig {
    pub fn collection_period(&self) -> Duration {
        Duration::from_secs(self.collection_interval.max(1))
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_interval.max(1))
    }

    pub fn final_flush_deadline(&self) -> Duration {
        Duration::from_secs(self.final_flush_timeout)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            collection_interval: default_collection_interval(),
            flush_interval: default_flush_interval(),
            final_flush_timeout: default_final_flush_timeout(),
            store_backend: default_memory_backend(),
            redis_prefix: default_usage_prefix(),
            default_range_days: default_range_days(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8082);
    }

    #[test]
    fn test_usage_defaults() {
        let usage = UsageConfig::default();
        assert_eq!(usage.collection_period(), Duration::from_secs(10));
        assert_eq!(usage.flush_period(), Duration::from_secs(60));
        assert_eq!(usage.final_flush_deadline(), Duration::from_secs(5));
        assert_eq!(usage.store_backend, "memory");
        assert_eq!(usage.default_range_days, 7);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let usage = UsageConfig {
            collection_interval: 0,
            flush_interval: 0,
            ..Default::default()
        };
        assert_eq!(usage.collection_period(), Duration::from_secs(1));
        assert_eq!(usage.flush_period(), Duration::from_secs(1));
    }
}
