use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};

use crate::metrics::{FLUSH_CYCLES, FLUSH_DURATION, FLUSH_FAILURES, FLUSH_RECORDS_WRITTEN};

use super::counters::UsageCounters;
use super::store::{UsageKey, UsageScope, UsageStore};

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: Vec<String>,
    pub failed: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Persists [`UsageCounters`] into daily usage records.
///
/// Tenants are written independently: a failed write leaves that tenant's
/// counters in place for the next cycle and does not affect the others.
/// Cycles never overlap, so a snapshot is always taken after the previous
/// cycle has committed.
#[derive(Clone)]
pub struct FlushPipeline {
    counters: Arc<UsageCounters>,
    store: Arc<dyn UsageStore>,
    cycle: Arc<Mutex<()>>,
}

impl FlushPipeline {
    pub fn new(counters: Arc<UsageCounters>, store: Arc<dyn UsageStore>) -> Self {
        Self {
            counters,
            store,
            cycle: Arc::new(Mutex::new(())),
        }
    }

    /// Flush everything pending into today's (UTC) records.
    pub async fn flush_once(&self) -> FlushReport {
        self.flush_for(Utc::now().date_naive()).await
    }

    /// Flush everything pending into the records for `date`.
    ///
    /// Waits for a cycle already in progress. The cycle itself runs on its own
    /// task, so dropping or aborting the caller never separates a store write
    /// from its commit.
    pub async fn flush_for(&self, date: NaiveDate) -> FlushReport {
        let guard = self.cycle.clone().lock_owned().await;
        let pipeline = self.clone();

        let cycle = tokio::spawn(async move {
            let report = pipeline.run_cycle(date).await;
            drop(guard);
            report
        });

        match cycle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(date = %date, error = %e, "Usage flush cycle aborted");
                FlushReport::default()
            }
        }
    }

    async fn run_cycle(&self, date: NaiveDate) -> FlushReport {
        let started = Instant::now();
        // Work on copies; the live counters are only touched by `commit`.
        let snapshot = self.counters.snapshot();

        let writes = snapshot.into_iter().map(|(tenant_id, tree)| {
            let store = self.store.clone();
            async move {
                let key = UsageKey::new(UsageScope::for_tenant(&tenant_id), date);
                let result = store.upsert_additive(&key, &tree).await;
                (tenant_id, tree, result)
            }
        });

        let mut report = FlushReport::default();
        for (tenant_id, tree, result) in join_all(writes).await {
            match result {
                Ok(()) => {
                    self.counters.commit(&tenant_id, &tree);
                    FLUSH_RECORDS_WRITTEN.inc();
                    report.flushed.push(tenant_id);
                }
                Err(e) => {
                    FLUSH_FAILURES.inc();
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        date = %date,
                        backend = self.store.backend_name(),
                        error = %e,
                        "Usage flush failed, counters kept for retry"
                    );
                    report.failed.push(tenant_id);
                }
            }
        }

        FLUSH_CYCLES.inc();
        FLUSH_DURATION.observe(started.elapsed().as_secs_f64());
        tracing::debug!(
            date = %date,
            flushed = report.flushed.len(),
            failed = report.failed.len(),
            "Usage flush cycle complete"
        );

        report
    }

    /// Best-effort flush at shutdown. `None` if the deadline passed first.
    pub async fn final_flush(&self, deadline: Duration) -> Option<FlushReport> {
        match tokio::time::timeout(deadline, self.flush_once()).await {
            Ok(report) => {
                tracing::info!(
                    flushed = report.flushed.len(),
                    failed = report.failed.len(),
                    "Final usage flush complete"
                );
                Some(report)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = deadline.as_secs(),
                    "Final usage flush timed out"
                );
                None
            }
        }
    }

    /// Flush every `period` until shutdown is signalled.
    pub async fn run(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip immediate first tick
        ticker.tick().await;

        tracing::info!(
            interval_secs = period.as_secs(),
            backend = self.store.backend_name(),
            "Usage flush pipeline started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Usage flush pipeline received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }

        tracing::info!("Usage flush pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::counters::{names, Category, CategoryTree, MetricValue, SYSTEM_TENANT};
    use crate::usage::store::{DailyUsageRecord, MemoryUsageStore, StoreError};
    use async_trait::async_trait;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[tokio::test]
    async fn test_flush_persists_and_clears() {
        let counters = Arc::new(UsageCounters::new());
        let store = Arc::new(MemoryUsageStore::new());
        let pipeline = FlushPipeline::new(counters.clone(), store.clone());

        counters.increment("acme", Category::Messages, names::IN, MetricValue::Count(5));
        counters.set("acme", Category::Agents, names::COUNT, MetricValue::Count(2));

        let report = pipeline.flush_for(day()).await;
        assert_eq!(report.flushed, vec!["acme".to_string()]);
        assert!(counters.is_empty("acme"));

        let records = store
            .query_range(&UsageScope::Tenant("acme".into()), day(), day())
            .await
            .unwrap();
        assert_eq!(records[0].value(Category::Messages, names::IN), Some(MetricValue::Count(5)));
        assert_eq!(records[0].value(Category::Agents, names::COUNT), Some(MetricValue::Count(2)));
    }

    #[tokio::test]
    async fn test_system_tenant_gets_system_record() {
        let counters = Arc::new(UsageCounters::new());
        let store = Arc::new(MemoryUsageStore::new());
        let pipeline = FlushPipeline::new(counters.clone(), store.clone());

        counters.set(SYSTEM_TENANT, Category::Resources, names::MEMORY_PERCENT, MetricValue::Ratio(3.5));
        pipeline.flush_for(day()).await;

        let records = store.query_range(&UsageScope::System, day(), day()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tenant_id, SYSTEM_TENANT);
        assert!(store
            .query_range(&UsageScope::Tenant(SYSTEM_TENANT.into()), day(), day())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_flush_writes_nothing() {
        let store = Arc::new(MemoryUsageStore::new());
        let pipeline = FlushPipeline::new(Arc::new(UsageCounters::new()), store.clone());
        let report = pipeline.flush_for(day()).await;
        assert!(report.flushed.is_empty() && report.is_clean());
        assert_eq!(store.record_count(), 0);
    }

    /// Delays every write, to hold a cycle open.
    struct SlowStore {
        inner: MemoryUsageStore,
        delay: Duration,
    }

    #[async_trait]
    impl UsageStore for SlowStore {
        fn backend_name(&self) -> &'static str {
            "slow"
        }

        async fn upsert_additive(
            &self,
            key: &UsageKey,
            tree: &CategoryTree,
        ) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
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
    async fn test_concurrent_flushes_write_once() {
        let counters = Arc::new(UsageCounters::new());
        let store = Arc::new(SlowStore {
            inner: MemoryUsageStore::new(),
            delay: Duration::from_millis(50),
        });
        let pipeline = FlushPipeline::new(counters.clone(), store.clone());
        counters.increment("acme", Category::Messages, names::IN, MetricValue::Count(5));

        let (first, second) = tokio::join!(pipeline.flush_for(day()), pipeline.flush_for(day()));
        assert_eq!(first.flushed.len() + second.flushed.len(), 1);

        let records = store
            .query_range(&UsageScope::Tenant("acme".into()), day(), day())
            .await
            .unwrap();
        assert_eq!(records[0].value(Category::Messages, names::IN), Some(MetricValue::Count(5)));
    }

    #[tokio::test]
    async fn test_dropped_caller_still_commits() {
        let counters = Arc::new(UsageCounters::new());
        let store = Arc::new(SlowStore {
            inner: MemoryUsageStore::new(),
            delay: Duration::from_millis(50),
        });
        let pipeline = FlushPipeline::new(counters.clone(), store.clone());
        counters.increment("acme", Category::Messages, names::IN, MetricValue::Count(5));

        let cancelled = tokio::time::timeout(Duration::from_millis(10), pipeline.flush_for(day())).await;
        assert!(cancelled.is_err());

        // Waits for the detached cycle, then finds nothing left to write
        let report = pipeline.flush_for(day()).await;
        assert!(report.flushed.is_empty());
        assert!(counters.is_empty("acme"));

        let records = store
            .query_range(&UsageScope::Tenant("acme".into()), day(), day())
            .await
            .unwrap();
        assert_eq!(records[0].value(Category::Messages, names::IN), Some(MetricValue::Count(5)));
    }

    #[tokio::test]
    async fn test_final_flush_within_deadline() {
        let counters = Arc::new(UsageCounters::new());
        let pipeline = FlushPipeline::new(counters.clone(), Arc::new(MemoryUsageStore::new()));
        counters.increment("acme", Category::Messages, names::OUT, MetricValue::Count(1));

        let report = pipeline.final_flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.flushed.len(), 1);
    }
}
