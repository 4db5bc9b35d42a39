use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::connection_manager::TenantConnectionRegistry;
use crate::metrics::AGGREGATOR_CYCLES;

use super::counters::{names, Category, MetricValue, UsageCounters, SYSTEM_TENANT};
use super::resources::ResourceSampler;

/// Agent and channel gauges for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantPresence {
    pub tenant_id: String,
    pub agents: u64,
    pub active_agents: u64,
    pub channels: u64,
    pub active_channels: u64,
}

/// Message traffic accumulated since the previous drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantTraffic {
    pub tenant_id: String,
    pub messages_in: u64,
    pub messages_out: u64,
    pub delivered: u64,
}

/// Live state outside the connection registry that the aggregator samples.
pub trait LiveStateSource: Send + Sync {
    fn presence(&self) -> Vec<TenantPresence>;

    /// Take and reset the traffic counted since the last call.
    fn drain_traffic(&self) -> Vec<TenantTraffic>;
}

/// Periodically samples live state into [`UsageCounters`].
pub struct MetricsAggregator {
    counters: Arc<UsageCounters>,
    registry: Arc<TenantConnectionRegistry>,
    live: Arc<dyn LiveStateSource>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    period: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl MetricsAggregator {
    pub fn new(
        counters: Arc<UsageCounters>,
        registry: Arc<TenantConnectionRegistry>,
        live: Arc<dyn LiveStateSource>,
        period: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            counters,
            registry,
            live,
            sampler: None,
            period,
            shutdown,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Run one collection cycle. Returns the number of tenants touched.
    ///
    /// Synchronous on purpose: the counters are never held across an await.
    pub fn collect_once(&self) -> usize {
        let mut touched: HashSet<String> = HashSet::new();
        let counters = &self.counters;

        let connections = self.registry.tenant_connection_counts();
        let total_sessions: usize = connections.iter().map(|c| c.sessions).sum();
        for tenant in connections {
            counters.set(
                &tenant.tenant_id,
                Category::Connections,
                names::COUNT,
                MetricValue::Count(tenant.sessions as u64),
            );
            touched.insert(tenant.tenant_id);
        }

        for p in self.live.presence() {
            counters.set(&p.tenant_id, Category::Agents, names::COUNT, MetricValue::Count(p.agents));
            counters.set(&p.tenant_id, Category::Agents, names::ACTIVE, MetricValue::Count(p.active_agents));
            counters.set(&p.tenant_id, Category::Channels, names::COUNT, MetricValue::Count(p.channels));
            counters.set(
                &p.tenant_id,
                Category::Channels,
                names::ACTIVE,
                MetricValue::Count(p.active_channels),
            );
            touched.insert(p.tenant_id);
        }

        for t in self.live.drain_traffic() {
            for (metric, n) in [
                (names::IN, t.messages_in),
                (names::OUT, t.messages_out),
                (names::DELIVERED, t.delivered),
            ] {
                if n > 0 {
                    counters.increment(&t.tenant_id, Category::Messages, metric, MetricValue::Count(n));
                }
            }
            touched.insert(t.tenant_id);
        }

        counters.set(
            SYSTEM_TENANT,
            Category::Connections,
            names::COUNT,
            MetricValue::Count(total_sessions as u64),
        );
        self.collect_resources();

        AGGREGATOR_CYCLES.inc();
        tracing::debug!(
            tenants = touched.len(),
            sessions = total_sessions,
            "Usage collection cycle complete"
        );

        touched.len()
    }

    fn collect_resources(&self) {
        let Some(sampler) = &self.sampler else {
            return;
        };

        match sampler.sample() {
            Ok(sample) => {
                if let Some(cpu) = sample.cpu_percent {
                    self.counters.set(SYSTEM_TENANT, Category::Resources, names::CPU_PERCENT, MetricValue::Ratio(cpu));
                }
                if let Some(mem) = sample.memory_percent {
                    self.counters.set(SYSTEM_TENANT, Category::Resources, names::MEMORY_PERCENT, MetricValue::Ratio(mem));
                }
                if let Some(rss) = sample.memory_rss_bytes {
                    self.counters.set(SYSTEM_TENANT, Category::Resources, names::MEMORY_RSS_BYTES, MetricValue::Count(rss));
                }
            }
            Err(e) => {
                // Omitted, not zeroed: a zero would read as an idle process.
                tracing::debug!(error = %e, "Resource sample unavailable, skipping resource metrics");
            }
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip immediate first tick
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.period.as_secs(),
            resources = self.sampler.is_some(),
            "Metrics aggregator started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Metrics aggregator received shutdown signal");
                    // Last cycle, so traffic since the previous tick reaches the final flush
                    self.collect_once();
                    break;
                }
                _ = ticker.tick() => {
                    self.collect_once();
                }
            }
        }

        tracing::info!("Metrics aggregator stopped");
    }
}
