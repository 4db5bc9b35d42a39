//! Usage metering end to end: live state -> counters -> store -> totals.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{broadcast, mpsc};

use ara_control_plane::bridge::{EventBridge, PresenceTracker};
use ara_control_plane::broker::{Broker, MemoryBroker};
use ara_control_plane::connection_manager::TenantConnectionRegistry;
use ara_control_plane::usage::store::{
    DailyUsageRecord, MemoryUsageStore, StoreError, UsageKey, UsageScope, UsageStore,
};
use ara_control_plane::usage::{
    names, Category, CategoryTree, FlushPipeline, LiveStateSource, MetricValue, MetricsAggregator,
    UsageCounters, UsageTotalsReducer,
};

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

/// Rejects writes for one tenant, delegates everything else.
struct FailingStore {
    inner: MemoryUsageStore,
    failing_tenant: String,
}

#[async_trait]
impl UsageStore for FailingStore {
    fn backend_name(&self) -> &'static str {
        "failing"
    }

    async fn upsert_additive(&self, key: &UsageKey, tree: &CategoryTree) -> Result<(), StoreError> {
        if key.scope.tenant_id() == self.failing_tenant {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.upsert_additive(key, tree).await
    }

    async fn query_range(
        &self,
        scope: &UsageScope,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, StoreError> {
        self.inner.query_range(scope, start, end).await
    }
}

#[tokio::test]
async fn test_flushes_add_into_the_same_daily_record() {
    let counters = Arc::new(UsageCounters::new());
    let store = Arc::new(MemoryUsageStore::new());
    let flush = FlushPipeline::new(counters.clone(), store.clone());

    counters.increment("T1", Category::Messages, names::IN, MetricValue::Count(5));
    assert!(flush.flush_for(day(1)).await.is_clean());
    assert!(counters.is_empty("T1"));

    counters.increment("T1", Category::Messages, names::IN, MetricValue::Count(3));
    assert!(flush.flush_for(day(1)).await.is_clean());

    let records = store
        .query_range(&UsageScope::for_tenant("T1"), day(1), day(1))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].value(Category::Messages, names::IN),
        Some(MetricValue::Count(8))
    );
}

#[tokio::test]
async fn test_totals_take_max_of_gauges_and_sum_of_flows() {
    let counters = Arc::new(UsageCounters::new());
    let store = Arc::new(MemoryUsageStore::new());
    let flush = FlushPipeline::new(counters.clone(), store.clone());

    for (d, agents, messages) in [(1, 2, 10), (2, 5, 20), (3, 3, 30)] {
        counters.set("T1", Category::Agents, names::COUNT, MetricValue::Count(agents));
        counters.increment("T1", Category::Messages, names::IN, MetricValue::Count(messages));
        assert!(flush.flush_for(day(d)).await.is_clean());
    }

    let reducer = UsageTotalsReducer::new(store, 7);
    let totals = reducer
        .get_usage_totals("T1", Some(day(1)), Some(day(3)))
        .await
        .unwrap();

    assert_eq!(totals.agents_total, 5);
    assert_eq!(totals.messages_in_total, 60);
    assert_eq!(totals.messages_out_total, 0);
    assert_eq!(totals.days_reported, 3);

    let other = reducer
        .get_usage_totals("T2", Some(day(1)), Some(day(3)))
        .await
        .unwrap();
    assert_eq!(other.agents_total, 0);
    assert_eq!(other.days_reported, 0);
}

#[tokio::test]
async fn test_failed_tenant_keeps_counters_others_are_cleared() {
    let counters = Arc::new(UsageCounters::new());
    let store = Arc::new(FailingStore {
        inner: MemoryUsageStore::new(),
        failing_tenant: "A".to_string(),
    });
    let flush = FlushPipeline::new(counters.clone(), store.clone());

    counters.increment("A", Category::Messages, names::IN, MetricValue::Count(4));
    counters.increment("B", Category::Messages, names::IN, MetricValue::Count(6));

    let report = flush.flush_for(day(1)).await;
    assert_eq!(report.failed, vec!["A".to_string()]);
    assert_eq!(report.flushed, vec!["B".to_string()]);

    assert!(!counters.is_empty("A"));
    assert!(counters.is_empty("B"));
    assert_eq!(
        counters.get("A", Category::Messages, names::IN).map(|m| m.value),
        Some(MetricValue::Count(4))
    );

    let b = store
        .query_range(&UsageScope::for_tenant("B"), day(1), day(1))
        .await
        .unwrap();
    assert_eq!(b[0].value(Category::Messages, names::IN), Some(MetricValue::Count(6)));

    let a = store
        .query_range(&UsageScope::for_tenant("A"), day(1), day(1))
        .await
        .unwrap();
    assert!(a.is_empty());
}

#[tokio::test]
async fn test_broker_events_are_metered_per_tenant() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = Arc::new(TenantConnectionRegistry::new());
    let presence = Arc::new(PresenceTracker::new());
    let bridge = EventBridge::new(broker.clone(), registry.clone(), presence.clone());
    bridge.start_monitor().await.unwrap();

    let (tx, _rx) = mpsc::channel(16);
    registry.connect("acme", "alice", tx);

    broker.publish("agents.acme.a1.connected", b"{}").await.unwrap();
    broker.publish("agents.acme.a2.registered", b"{}").await.unwrap();
    broker
        .publish("messages.acme.c1.in", br#"{"data":{"count":3}}"#)
        .await
        .unwrap();
    broker.publish("messages.globex.c9.out", b"{}").await.unwrap();

    let counters = Arc::new(UsageCounters::new());
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let live: Arc<dyn LiveStateSource> = presence;
    let aggregator = MetricsAggregator::new(
        counters.clone(),
        registry,
        live,
        std::time::Duration::from_secs(10),
        shutdown_rx,
    );
    aggregator.collect_once();

    let store = Arc::new(MemoryUsageStore::new());
    let flush = FlushPipeline::new(counters.clone(), store.clone());
    assert!(flush.flush_for(day(1)).await.is_clean());

    let acme = store
        .query_range(&UsageScope::for_tenant("acme"), day(1), day(1))
        .await
        .unwrap();
    assert_eq!(acme[0].value(Category::Agents, names::COUNT), Some(MetricValue::Count(2)));
    assert_eq!(acme[0].value(Category::Agents, names::ACTIVE), Some(MetricValue::Count(1)));
    assert_eq!(acme[0].value(Category::Messages, names::IN), Some(MetricValue::Count(3)));
    assert_eq!(acme[0].value(Category::Connections, names::COUNT), Some(MetricValue::Count(1)));

    let globex = store
        .query_range(&UsageScope::for_tenant("globex"), day(1), day(1))
        .await
        .unwrap();
    assert_eq!(globex[0].value(Category::Messages, names::OUT), Some(MetricValue::Count(1)));
    assert_eq!(globex[0].value(Category::Messages, names::IN), None);

    let system = store
        .query_range(&UsageScope::System, day(1), day(1))
        .await
        .unwrap();
    assert_eq!(system[0].value(Category::Connections, names::COUNT), Some(MetricValue::Count(1)));
}
