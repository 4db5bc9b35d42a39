//! In-memory usage store for single-node setups and tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;

use crate::usage::counters::CategoryTree;

use super::{
    merge_additive, DailyUsageRecord, StoreError, UsageKey, UsageScope, UsageStore, ValueTree,
};

#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    records: DashMap<UsageKey, ValueTree>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn upsert_additive(&self, key: &UsageKey, tree: &CategoryTree) -> Result<(), StoreError> {
        let mut record = self.records.entry(key.clone()).or_default();
        merge_additive(&mut record, tree);
        Ok(())
    }

    async fn query_range(
        &self,
        scope: &UsageScope,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageRecord>, StoreError> {
        let mut records: Vec<DailyUsageRecord> = self
            .records
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.scope == *scope && key.date >= start && key.date <= end
            })
            .map(|entry| DailyUsageRecord {
                tenant_id: scope.tenant_id().to_string(),
                date: entry.key().date,
                categories: entry.value().clone(),
            })
            .collect();

        records.sort_by_key(|r| r.date);
        Ok(records)
    }
}
