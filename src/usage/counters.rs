//! In-memory per-tenant usage counters.

use std::collections::BTreeMap;
use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Pseudo-tenant holding process-wide resource metrics.
pub const SYSTEM_TENANT: &str = "system";

/// Metric names used by the aggregator.
pub mod names {
    pub const COUNT: &str = "count";
    pub const ACTIVE: &str = "active";
    pub const IN: &str = "in";
    pub const OUT: &str = "out";
    pub const DELIVERED: &str = "delivered";
    pub const CPU_PERCENT: &str = "cpu_percent";
    pub const MEMORY_PERCENT: &str = "memory_percent";
    pub const MEMORY_RSS_BYTES: &str = "memory_rss_bytes";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Agents,
    Channels,
    Messages,
    Connections,
    Resources,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Agents,
        Category::Channels,
        Category::Messages,
        Category::Connections,
        Category::Resources,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Agents => "agents",
            Category::Channels => "channels",
            Category::Messages => "messages",
            Category::Connections => "connections",
            Category::Resources => "resources",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer counts, or floats for resource percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u64),
    Ratio(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Count(n) => n as f64,
            MetricValue::Ratio(r) => r,
        }
    }

    pub fn as_u64(&self) -> u64 {
        match *self {
            MetricValue::Count(n) => n,
            MetricValue::Ratio(r) if r > 0.0 => r.round() as u64,
            MetricValue::Ratio(_) => 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            MetricValue::Count(n) => n == 0,
            MetricValue::Ratio(r) => r == 0.0,
        }
    }

    pub fn add(self, other: MetricValue) -> MetricValue {
        match (self, other) {
            (MetricValue::Count(a), MetricValue::Count(b)) => MetricValue::Count(a.saturating_add(b)),
            (a, b) => MetricValue::Ratio(a.as_f64() + b.as_f64()),
        }
    }

    /// Subtract, never going below zero.
    pub fn saturating_sub(self, other: MetricValue) -> MetricValue {
        match (self, other) {
            (MetricValue::Count(a), MetricValue::Count(b)) => MetricValue::Count(a.saturating_sub(b)),
            (a, b) => MetricValue::Ratio((a.as_f64() - b.as_f64()).max(0.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Point-in-time value; overwritten in memory and in the store.
    Gauge,
    /// Accumulated value; added to the store's running total.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub kind: MetricKind,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(value: MetricValue) -> Self {
        Self {
            kind: MetricKind::Gauge,
            value,
        }
    }

    pub fn counter(value: MetricValue) -> Self {
        Self {
            kind: MetricKind::Counter,
            value,
        }
    }
}

/// category -> metric name -> metric
pub type CategoryTree = BTreeMap<Category, BTreeMap<String, Metric>>;

/// Per-tenant metric trees shared by the aggregator (writer) and the flush
/// pipeline (reader/committer).
///
/// Every method is synchronous, so each update is atomic with respect to the
/// async tasks that share this structure.
#[derive(Debug, Default)]
pub struct UsageCounters {
    tenants: DashMap<String, CategoryTree>,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to an accumulating metric (missing = 0).
    pub fn increment(&self, tenant_id: &str, category: Category, metric: &str, delta: MetricValue) {
        let mut tree = self.tenants.entry(tenant_id.to_string()).or_default();
        let slot = tree
            .entry(category)
            .or_default()
            .entry(metric.to_string())
            .or_insert(Metric::counter(MetricValue::Count(0)));

        if slot.kind != MetricKind::Counter {
            tracing::warn!(
                tenant_id = %tenant_id,
                category = %category,
                metric = %metric,
                "Gauge metric incremented, treating as counter"
            );
            *slot = Metric::counter(MetricValue::Count(0));
        }
        slot.value = slot.value.add(delta);
    }

    /// Overwrite a point-in-time metric.
    pub fn set(&self, tenant_id: &str, category: Category, metric: &str, value: MetricValue) {
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .entry(category)
            .or_default()
            .insert(metric.to_string(), Metric::gauge(value));
    }

    pub fn get(&self, tenant_id: &str, category: Category, metric: &str) -> Option<Metric> {
        self.tenants
            .get(tenant_id)
            .and_then(|tree| tree.get(&category).and_then(|m| m.get(metric).copied()))
    }

    /// Copies of every non-empty tenant tree, for work that has to await.
    pub fn snapshot(&self) -> Vec<(String, CategoryTree)> {
        self.tenants
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn tenant_snapshot(&self, tenant_id: &str) -> Option<CategoryTree> {
        self.tenants.get(tenant_id).map(|tree| tree.clone())
    }

    /// Every tenant seen so far, including those with nothing pending.
    pub fn tenants(&self) -> Vec<String> {
        self.tenants.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_empty(&self, tenant_id: &str) -> bool {
        self.tenants
            .get(tenant_id)
            .map(|tree| tree.is_empty())
            .unwrap_or(true)
    }

    /// Forget what `flushed` persisted.
    ///
    /// Counters are reduced by the flushed amount, so increments that landed
    /// while the write was in flight stay pending. Gauges are removed only if
    /// they still hold the flushed value. The tenant itself stays known.
    pub fn commit(&self, tenant_id: &str, flushed: &CategoryTree) {
        let Some(mut tree) = self.tenants.get_mut(tenant_id) else {
            return;
        };

        for (category, metrics) in flushed {
            let Some(live) = tree.get_mut(category) else {
                continue;
            };

            for (name, sent) in metrics {
                let drop_it = match live.get_mut(name) {
                    Some(current) if current.kind == MetricKind::Counter && sent.kind == MetricKind::Counter => {
                        current.value = current.value.saturating_sub(sent.value);
                        current.value.is_zero()
                    }
                    Some(current) => current == sent,
                    None => false,
                };
                if drop_it {
                    live.remove(name);
                }
            }

            if live.is_empty() {
                tree.remove(category);
            }
        }
    }
}
