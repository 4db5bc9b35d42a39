//! Durable storage for daily usage records.
//!
//! Every backend honours the same upsert contract: counters are added to the
//! day's running total, gauges overwrite, and categories or metrics absent
//! from a write are left untouched.

mod factory;
mod memory;
mod postgres;
mod redis;

pub use factory::create_usage_store;
pub use memory::MemoryUsageStore;
pub use postgres::PostgresUsageStore;
pub use self::redis::RedisUsageStore;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use super::counters::{Category, CategoryTree, MetricKind, MetricValue, SYSTEM_TENANT};

/// Persisted values: category -> metric -> value
pub type ValueTree = BTreeMap<Category, BTreeMap<String, MetricValue>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt usage record: {0}")]
    Corrupt(String),
}

/// Whose usage a record describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsageScope {
    Tenant(String),
    /// Process-wide metrics of the system pseudo-tenant
    System,
}

impl UsageScope {
    pub fn for_tenant(tenant_id: &str) -> Self {
        if tenant_id == SYSTEM_TENANT {
            UsageScope::System
        } else {
            UsageScope::Tenant(tenant_id.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UsageScope::Tenant(_) => "tenant",
            UsageScope::System => "system",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            UsageScope::Tenant(id) => id,
            UsageScope::System => SYSTEM_TENANT,
        }
    }
}

impl fmt::Display for UsageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageScope::Tenant(id) => write!(f, "tenant:{}", id),
            UsageScope::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub scope: UsageScope,
    pub date: NaiveDate,
}

impl UsageKey {
    pub fn new(scope: UsageScope, date: NaiveDate) -> Self {
        Self { scope, date }
    }
}

/// One calendar day of persisted usage for a tenant (or the system scope).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUsageRecord {
    pub tenant_id: String,
    pub date: NaiveDate,
    pub categories: ValueTree,
}

impl DailyUsageRecord {
    pub fn value(&self, category: Category, metric: &str) -> Option<MetricValue> {
        self.categories
            .get(&category)
            .and_then(|metrics| metrics.get(metric).copied())
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Merge `tree` into the record at `key`: counters add, gauges overwrite.
    async fn upsert_additive(&self, key: &UsageKey, tree: &CategoryTree) -> Result<(), StoreError>;

    /// Records for `scope` with `start <= date <= end`, ordered by date.
    async fn query_range(
        &self,
        scope: &UsageScope,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, StoreError>;
}

/// Apply the upsert contract to an in-memory value tree.
pub fn merge_additive(existing: &mut ValueTree, incoming: &CategoryTree) {
    for (category, metrics) in incoming {
        let slot = existing.entry(*category).or_default();
        for (name, metric) in metrics {
            match metric.kind {
                MetricKind::Counter => {
                    let current = slot.entry(name.clone()).or_insert(MetricValue::Count(0));
                    *current = current.add(metric.value);
                }
                MetricKind::Gauge => {
                    slot.insert(name.clone(), metric.value);
                }
            }
        }
    }
}

/// `category.metric` field name used by flat key/value backends.
pub(crate) fn field_name(category: Category, metric: &str) -> String {
    format!("{}.{}", category.as_str(), metric)
}

pub(crate) fn split_field(field: &str) -> Option<(Category, &str)> {
    let (category, metric) = field.split_once('.')?;
    if metric.is_empty() {
        return None;
    }
    Some((Category::parse(category)?, metric))
}

/// Inclusive list of dates, start to end.
pub(crate) fn dates_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::counters::Metric;

    fn tree(entries: &[(Category, &str, Metric)]) -> CategoryTree {
        let mut tree = CategoryTree::new();
        for (category, name, metric) in entries {
            tree.entry(*category).or_default().insert(name.to_string(), *metric);
        }
        tree
    }

    #[test]
    fn test_merge_adds_counters_and_overwrites_gauges() {
        let mut existing = ValueTree::new();
        merge_additive(
            &mut existing,
            &tree(&[
                (Category::Messages, "in", Metric::counter(MetricValue::Count(5))),
                (Category::Agents, "count", Metric::gauge(MetricValue::Count(4))),
            ]),
        );
        merge_additive(
            &mut existing,
            &tree(&[
                (Category::Messages, "in", Metric::counter(MetricValue::Count(3))),
                (Category::Agents, "count", Metric::gauge(MetricValue::Count(2))),
            ]),
        );

        assert_eq!(existing[&Category::Messages]["in"], MetricValue::Count(8));
        assert_eq!(existing[&Category::Agents]["count"], MetricValue::Count(2));
    }

    #[test]
    fn test_merge_leaves_other_categories() {
        let mut existing = ValueTree::new();
        merge_additive(
            &mut existing,
            &tree(&[(Category::Agents, "count", Metric::gauge(MetricValue::Count(4)))]),
        );
        merge_additive(
            &mut existing,
            &tree(&[(Category::Messages, "in", Metric::counter(MetricValue::Count(1)))]),
        );

        assert_eq!(existing[&Category::Agents]["count"], MetricValue::Count(4));
    }

    #[test]
    fn test_field_names() {
        assert_eq!(field_name(Category::Resources, "cpu_percent"), "resources.cpu_percent");
        assert_eq!(split_field("messages.in"), Some((Category::Messages, "in")));
        assert_eq!(split_field("widgets.in"), None);
        assert_eq!(split_field("messages."), None);
        assert_eq!(split_field("messages"), None);
    }

    #[test]
    fn test_scope() {
        assert_eq!(UsageScope::for_tenant("system"), UsageScope::System);
        assert_eq!(UsageScope::for_tenant("acme"), UsageScope::Tenant("acme".into()));
        assert_eq!(UsageScope::System.tenant_id(), "system");
    }

    #[test]
    fn test_dates_between() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(dates_between(start, end).len(), 3);
        assert!(dates_between(end, start).is_empty());
    }
}
