mod settings;

pub use settings::{
    ApiConfig, BrokerConfig, DatabaseConfig, JwtConfig, OtelConfig, RedisConfig, ServerConfig,
    Settings, UsageConfig, WebSocketConfig,
};
