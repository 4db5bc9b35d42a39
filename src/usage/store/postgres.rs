//! PostgreSQL usage store: one row per (scope, tenant, date, category, metric).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::usage::counters::{Category, CategoryTree, MetricValue};

use super::{DailyUsageRecord, StoreError, UsageKey, UsageScope, UsageStore, ValueTree};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS usage_metrics (
    scope        TEXT NOT NULL,
    tenant_id    TEXT NOT NULL,
    usage_date   DATE NOT NULL,
    category     TEXT NOT NULL,
    metric       TEXT NOT NULL,
    kind         TEXT NOT NULL,
    int_value    BIGINT,
    float_value  DOUBLE PRECISION,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (scope, tenant_id, usage_date, category, metric)
)
"#;

// Counters add to the stored value, gauges replace it.
const UPSERT_METRIC: &str = r#"
INSERT INTO usage_metrics
    (scope, tenant_id, usage_date, category, metric, kind, int_value, float_value)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (scope, tenant_id, usage_date, category, metric) DO UPDATE SET
    kind = EXCLUDED.kind,
    int_value = CASE WHEN EXCLUDED.kind = 'counter'
        THEN COALESCE(usage_metrics.int_value, 0) + EXCLUDED.int_value
        ELSE EXCLUDED.int_value END,
    float_value = CASE WHEN EXCLUDED.kind = 'counter'
        THEN COALESCE(usage_metrics.float_value, 0) + EXCLUDED.float_value
        ELSE EXCLUDED.float_value END,
    updated_at = NOW()
"#;

const SELECT_RANGE: &str = r#"
SELECT usage_date, category, metric, int_value, float_value
FROM usage_metrics
WHERE scope = $1 AND tenant_id = $2 AND usage_date BETWEEN $3 AND $4
ORDER BY usage_date
"#;

pub struct PostgresUsageStore {
    pool: PgPool,
}

impl PostgresUsageStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
            .connect(&config.url)
            .await?;

        tracing::info!(pool_size = config.pool_size, "PostgreSQL usage store pool created");

        let store = Self::with_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

/// Column pair for a value: exactly one side is set.
fn to_columns(value: MetricValue) -> (Option<i64>, Option<f64>) {
    match value {
        MetricValue::Count(n) => (Some(i64::try_from(n).unwrap_or(i64::MAX)), None),
        MetricValue::Ratio(r) => (None, Some(r)),
    }
}

fn from_columns(int_value: Option<i64>, float_value: Option<f64>) -> Option<MetricValue> {
    match (int_value, float_value) {
        (Some(n), _) => Some(MetricValue::Count(n.max(0) as u64)),
        (None, Some(r)) => Some(MetricValue::Ratio(r)),
        (None, None) => None,
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_additive(&self, key: &UsageKey, tree: &CategoryTree) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for (category, metrics) in tree {
            for (name, metric) in metrics {
                let (int_value, float_value) = to_columns(metric.value);
                sqlx::query(UPSERT_METRIC)
                    .bind(key.scope.kind())
                    .bind(key.scope.tenant_id())
                    .bind(key.date)
                    .bind(category.as_str())
                    .bind(name)
                    .bind(metric.kind.as_str())
                    .bind(int_value)
                    .bind(float_value)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_range(
        &self,
        scope: &UsageScope,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, StoreError> {
        let rows: Vec<(NaiveDate, String, String, Option<i64>, Option<f64>)> =
            sqlx::query_as(SELECT_RANGE)
                .bind(scope.kind())
                .bind(scope.tenant_id())
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?;

        let mut by_date: BTreeMap<NaiveDate, ValueTree> = BTreeMap::new();
        for (date, category, metric, int_value, float_value) in rows {
            let Some(category) = Category::parse(&category) else {
                tracing::warn!(category = %category, "Skipping row with unknown usage category");
                continue;
            };
            let value = from_columns(int_value, float_value).ok_or_else(|| {
                StoreError::Corrupt(format!("{} {} {}.{} has no value", scope, date, category, metric))
            })?;
            by_date
                .entry(date)
                .or_default()
                .entry(category)
                .or_default()
                .insert(metric, value);
        }

        Ok(by_date
            .into_iter()
            .map(|(date, categories)| DailyUsageRecord {
                tenant_id: scope.tenant_id().to_string(),
                date,
                categories,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_columns() {
        assert_eq!(to_columns(MetricValue::Count(7)), (Some(7), None));
        assert_eq!(to_columns(MetricValue::Ratio(0.5)), (None, Some(0.5)));
        assert_eq!(to_columns(MetricValue::Count(u64::MAX)), (Some(i64::MAX), None));

        assert_eq!(from_columns(Some(7), None), Some(MetricValue::Count(7)));
        assert_eq!(from_columns(None, Some(0.5)), Some(MetricValue::Ratio(0.5)));
        assert_eq!(from_columns(None, None), None);
    }

    #[test]
    fn test_upsert_statement_adds_counters() {
        assert!(UPSERT_METRIC.contains("ON CONFLICT (scope, tenant_id, usage_date, category, metric)"));
        assert!(UPSERT_METRIC.contains("COALESCE(usage_metrics.int_value, 0) + EXCLUDED.int_value"));
    }
}
