use std::sync::Arc;
use std::time::Instant;

use crate::auth::{IdentityVerifier, JwtValidator};
use crate::bridge::{EventBridge, PresenceTracker};
use crate::broker::{create_broker, Broker};
use crate::config::Settings;
use crate::connection_manager::TenantConnectionRegistry;
use crate::usage::store::{create_usage_store, UsageStore};
use crate::usage::{FlushPipeline, UsageCounters, UsageTotalsReducer};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub registry: Arc<TenantConnectionRegistry>,
    pub broker: Arc<dyn Broker>,
    pub bridge: Arc<EventBridge>,
    pub counters: Arc<UsageCounters>,
    pub store: Arc<dyn UsageStore>,
    pub flush: FlushPipeline,
    pub totals: Arc<UsageTotalsReducer>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the state with backends chosen by `settings`.
    pub async fn new(settings: Settings) -> Self {
        let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtValidator::new(&settings.jwt));
        let broker = create_broker(&settings.broker, &settings.redis);
        let store =
            create_usage_store(&settings.usage, &settings.redis, &settings.database).await;

        Self::with_parts(settings, identity, broker, store)
    }

    /// Build the state around explicit collaborators.
    pub fn with_parts(
        settings: Settings,
        identity: Arc<dyn IdentityVerifier>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn UsageStore>,
    ) -> Self {
        let registry = Arc::new(TenantConnectionRegistry::new());
        let bridge = Arc::new(EventBridge::new(
            broker.clone(),
            registry.clone(),
            Arc::new(PresenceTracker::new()),
        ));
        let counters = Arc::new(UsageCounters::new());
        let flush = FlushPipeline::new(counters.clone(), store.clone());
        let totals = Arc::new(UsageTotalsReducer::new(
            store.clone(),
            settings.usage.default_range_days,
        ));

        Self {
            settings: Arc::new(settings),
            identity,
            registry,
            broker,
            bridge,
            counters,
            store,
            flush,
            totals,
            start_time: Instant::now(),
        }
    }
}
