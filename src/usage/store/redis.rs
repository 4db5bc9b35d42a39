//! Redis usage store.
//!
//! One hash per scope and day, `{prefix}:tenant:{tenant_id}:{date}` or
//! `{prefix}:system:{date}`, with one `category.metric` field per metric.
//! Counters go through HINCRBY / HINCRBYFLOAT and gauges through HSET, all
//! inside one MULTI/EXEC pipeline.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::RwLock;

use crate::config::RedisConfig;
use crate::usage::counters::{Category, CategoryTree, MetricKind, MetricValue};

use super::{
    dates_between, field_name, split_field, DailyUsageRecord, StoreError, UsageKey, UsageScope,
    UsageStore, ValueTree,
};

/// Daily hashes expire after ~13 months.
const RETENTION_SECS: i64 = 400 * 24 * 60 * 60;

pub struct RedisUsageStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    prefix: String,
}

impl RedisUsageStore {
    pub fn new(config: &RedisConfig, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            prefix: prefix.into(),
        })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, StoreError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(ref c) = *guard {
            return Ok(c.clone());
        }

        let conn = self.client.get_multiplexed_tokio_connection().await?;
        *guard = Some(conn.clone());
        tracing::info!("Redis usage store connection established");
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.connection.write().await = None;
    }

    fn record_key(&self, scope: &UsageScope, date: NaiveDate) -> String {
        match scope {
            UsageScope::Tenant(id) => format!("{}:tenant:{}:{}", self.prefix, id, date),
            UsageScope::System => format!("{}:system:{}", self.prefix, date),
        }
    }
}

fn format_gauge(value: MetricValue) -> String {
    match value {
        MetricValue::Count(n) => n.to_string(),
        // Debug keeps a trailing ".0" so the value reads back as a float
        MetricValue::Ratio(r) => format!("{:?}", r),
    }
}

fn parse_value(category: Category, metric: &str, raw: &str) -> Option<MetricValue> {
    let is_ratio = (category == Category::Resources && metric.ends_with("_percent"))
        || raw.contains(['.', 'e', 'E']);
    if is_ratio {
        raw.parse::<f64>().ok().map(MetricValue::Ratio)
    } else {
        raw.parse::<u64>().ok().map(MetricValue::Count)
    }
}

/// Rebuild a value tree from a hash. Unknown fields are skipped.
fn parse_hash(key: &str, hash: HashMap<String, String>) -> Result<ValueTree, StoreError> {
    let mut tree = ValueTree::new();
    for (field, raw) in hash {
        let Some((category, metric)) = split_field(&field) else {
            tracing::warn!(key = %key, field = %field, "Skipping unknown usage field");
            continue;
        };
        let value = parse_value(category, metric, &raw)
            .ok_or_else(|| StoreError::Corrupt(format!("{} {} = {:?}", key, field, raw)))?;
        tree.entry(category).or_default().insert(metric.to_string(), value);
    }
    Ok(tree)
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn upsert_additive(&self, key: &UsageKey, tree: &CategoryTree) -> Result<(), StoreError> {
        let record_key = self.record_key(&key.scope, key.date);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (category, metrics) in tree {
            for (name, metric) in metrics {
                let field = field_name(*category, name);
                match (metric.kind, metric.value) {
                    (MetricKind::Counter, MetricValue::Count(n)) => {
                        pipe.cmd("HINCRBY").arg(&record_key).arg(&field).arg(n).ignore();
                    }
                    (MetricKind::Counter, MetricValue::Ratio(r)) => {
                        pipe.cmd("HINCRBYFLOAT").arg(&record_key).arg(&field).arg(r).ignore();
                    }
                    (MetricKind::Gauge, value) => {
                        pipe.cmd("HSET")
                            .arg(&record_key)
                            .arg(&field)
                            .arg(format_gauge(value))
                            .ignore();
                    }
                }
            }
        }
        pipe.cmd("EXPIRE").arg(&record_key).arg(RETENTION_SECS).ignore();

        let mut conn = self.get_connection().await?;
        let result: Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
        if let Err(e) = result {
            self.reset_connection().await;
            return Err(e.into());
        }

        tracing::debug!(key = %record_key, "Usage record upserted");
        Ok(())
    }

    async fn query_range(
        &self,
        scope: &UsageScope,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, StoreError> {
        let dates = dates_between(start, end);
        if dates.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = dates.iter().map(|d| self.record_key(scope, *d)).collect();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HGETALL").arg(key);
        }

        let mut conn = self.get_connection().await?;
        let hashes: Vec<HashMap<String, String>> = match pipe.query_async(&mut conn).await {
            Ok(hashes) => hashes,
            Err(e) => {
                self.reset_connection().await;
                return Err(e.into());
            }
        };

        let mut records = Vec::new();
        for ((date, key), hash) in dates.into_iter().zip(&keys).zip(hashes) {
            if hash.is_empty() {
                continue;
            }
            records.push(DailyUsageRecord {
                tenant_id: scope.tenant_id().to_string(),
                date,
                categories: parse_hash(key, hash)?,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RedisUsageStore {
        RedisUsageStore::new(&RedisConfig::default(), "ara:usage").unwrap()
    }

    #[test]
    fn test_record_keys() {
        let store = store();
        let date = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        assert_eq!(
            store.record_key(&UsageScope::Tenant("acme".into()), date),
            "ara:usage:tenant:acme:2024-01-03"
        );
        assert_eq!(store.record_key(&UsageScope::System, date), "ara:usage:system:2024-01-03");
    }

    #[test]
    fn test_value_parsing() {
        assert_eq!(parse_value(Category::Messages, "in", "8"), Some(MetricValue::Count(8)));
        assert_eq!(
            parse_value(Category::Resources, "cpu_percent", "50"),
            Some(MetricValue::Ratio(50.0))
        );
        assert_eq!(
            parse_value(Category::Resources, "memory_percent", &format_gauge(MetricValue::Ratio(12.0))),
            Some(MetricValue::Ratio(12.0))
        );
        assert_eq!(parse_value(Category::Messages, "in", "eight"), None);
    }

    #[test]
    fn test_parse_hash() {
        let mut hash = HashMap::new();
        hash.insert("agents.count".to_string(), "3".to_string());
        hash.insert("messages.in".to_string(), "20".to_string());
        hash.insert("legacy".to_string(), "1".to_string());

        let tree = parse_hash("k", hash).unwrap();
        assert_eq!(tree[&Category::Agents]["count"], MetricValue::Count(3));
        assert_eq!(tree[&Category::Messages]["in"], MetricValue::Count(20));

        let mut bad = HashMap::new();
        bad.insert("agents.count".to_string(), "x".to_string());
        assert!(matches!(parse_hash("k", bad), Err(StoreError::Corrupt(_))));
    }
}
