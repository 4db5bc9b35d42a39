//! Usage totals over a date range, computed from persisted records only.

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use super::counters::{names, Category};
use super::store::{DailyUsageRecord, StoreError, UsageScope, UsageStore};

/// Longest range a single report may cover, in days.
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Error)]
pub enum TotalsError {
    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("range of {0} days exceeds the maximum of {max}", max = MAX_RANGE_DAYS)]
    RangeTooLarge(i64),

    #[error("no default start date exists before {0}")]
    OutOfRange(NaiveDate),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub tenant_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub agents_total: u64,
    pub active_agents_total: u64,
    pub channels_total: u64,
    pub active_channels_total: u64,
    pub messages_in_total: u64,
    pub messages_out_total: u64,
    pub days_reported: usize,
}

impl UsageTotals {
    /// Gauges take the maximum across days, message flows the sum. Missing
    /// categories count as zero.
    pub fn reduce(
        tenant_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        records: &[DailyUsageRecord],
    ) -> Self {
        let read = |record: &DailyUsageRecord, category: Category, metric: &str| {
            record
                .value(category, metric)
                .map(|v| v.as_u64())
                .unwrap_or(0)
        };

        records.iter().fold(
            UsageTotals {
                tenant_id: tenant_id.to_string(),
                start_date,
                end_date,
                ..Default::default()
            },
            |mut t, r| {
                t.agents_total = t.agents_total.max(read(r, Category::Agents, names::COUNT));
                t.active_agents_total = t.active_agents_total.max(read(r, Category::Agents, names::ACTIVE));
                t.channels_total = t.channels_total.max(read(r, Category::Channels, names::COUNT));
                t.active_channels_total =
                    t.active_channels_total.max(read(r, Category::Channels, names::ACTIVE));
                t.messages_in_total =
                    t.messages_in_total.saturating_add(read(r, Category::Messages, names::IN));
                t.messages_out_total =
                    t.messages_out_total.saturating_add(read(r, Category::Messages, names::OUT));
                t.days_reported += 1;
                t
            },
        )
    }
}

/// Fill in defaults and validate a requested range.
///
/// `end` defaults to `today`, `start` to `default_days` before `end`.
pub fn resolve_range(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
    default_days: u32,
) -> Result<(NaiveDate, NaiveDate), TotalsError> {
    let end = end.unwrap_or(today);
    let start = match start {
        Some(start) => start,
        None => end
            .checked_sub_days(Days::new(default_days.into()))
            .ok_or(TotalsError::OutOfRange(end))?,
    };

    if start > end {
        return Err(TotalsError::InvalidRange { start, end });
    }
    let days = (end - start).num_days() + 1;
    if days > MAX_RANGE_DAYS {
        return Err(TotalsError::RangeTooLarge(days));
    }
    Ok((start, end))
}

pub struct UsageTotalsReducer {
    store: Arc<dyn UsageStore>,
    default_range_days: u32,
}

impl UsageTotalsReducer {
    pub fn new(store: Arc<dyn UsageStore>, default_range_days: u32) -> Self {
        Self {
            store,
            default_range_days,
        }
    }

    pub async fn get_usage_totals(
        &self,
        tenant_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<UsageTotals, TotalsError> {
        let (start, end) = resolve_range(start, end, Utc::now().date_naive(), self.default_range_days)?;
        let scope = UsageScope::for_tenant(tenant_id);
        let records = self.store.query_range(&scope, start, end).await?;

        tracing::debug!(
            tenant_id = %tenant_id,
            start = %start,
            end = %end,
            records = records.len(),
            "Usage totals computed"
        );

        Ok(UsageTotals::reduce(tenant_id, start, end, &records))
    }

    /// Raw daily records of the system scope.
    pub async fn system_usage(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<DailyUsageRecord>, TotalsError> {
        let (start, end) = resolve_range(start, end, Utc::now().date_naive(), self.default_range_days)?;
        Ok(self.store.query_range(&UsageScope::System, start, end).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::counters::MetricValue;
    use crate::usage::store::ValueTree;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(day: u32, entries: &[(Category, &str, u64)]) -> DailyUsageRecord {
        let mut categories = ValueTree::new();
        for (category, metric, n) in entries {
            categories
                .entry(*category)
                .or_default()
                .insert(metric.to_string(), MetricValue::Count(*n));
        }
        DailyUsageRecord {
            tenant_id: "T".into(),
            date: date(2024, 1, day),
            categories,
        }
    }

    #[test]
    fn test_reduce_max_and_sum() {
        let records = vec![
            record(1, &[(Category::Agents, names::COUNT, 2), (Category::Messages, names::IN, 10)]),
            record(2, &[(Category::Agents, names::COUNT, 5), (Category::Messages, names::IN, 20)]),
            record(3, &[(Category::Agents, names::COUNT, 3), (Category::Messages, names::IN, 30)]),
        ];
        let totals = UsageTotals::reduce("T", date(2024, 1, 1), date(2024, 1, 3), &records);
        assert_eq!(totals.agents_total, 5);
        assert_eq!(totals.messages_in_total, 60);
        assert_eq!(totals.days_reported, 3);
    }

    #[test]
    fn test_missing_categories_are_zero() {
        let records = vec![record(1, &[(Category::Channels, names::ACTIVE, 4)]), record(2, &[])];
        let totals = UsageTotals::reduce("T", date(2024, 1, 1), date(2024, 1, 2), &records);
        assert_eq!(totals.active_channels_total, 4);
        assert_eq!(totals.agents_total, 0);
        assert_eq!(totals.messages_out_total, 0);
    }

    #[test]
    fn test_empty_range_is_all_zero() {
        let totals = UsageTotals::reduce("T", date(2024, 1, 1), date(2024, 1, 2), &[]);
        assert_eq!(
            totals,
            UsageTotals {
                tenant_id: "T".into(),
                start_date: date(2024, 1, 1),
                end_date: date(2024, 1, 2),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_resolve_range_defaults() {
        let today = date(2024, 3, 10);
        assert_eq!(
            resolve_range(None, None, today, 7).unwrap(),
            (date(2024, 3, 3), today)
        );
        assert_eq!(
            resolve_range(None, Some(date(2024, 1, 8)), today, 7).unwrap(),
            (date(2024, 1, 1), date(2024, 1, 8))
        );
    }

    #[test]
    fn test_resolve_range_rejects_bad_ranges() {
        let today = date(2024, 3, 10);
        assert!(matches!(
            resolve_range(Some(date(2024, 3, 5)), Some(date(2024, 3, 1)), today, 7),
            Err(TotalsError::InvalidRange { .. })
        ));
        assert!(matches!(
            resolve_range(Some(date(2022, 1, 1)), Some(date(2024, 1, 1)), today, 7),
            Err(TotalsError::RangeTooLarge(_))
        ));
        assert!(resolve_range(Some(date(2024, 1, 1)), Some(date(2024, 12, 31)), today, 7).is_ok());
    }

    #[test]
    fn test_resolve_range_near_min_date() {
        let today = date(2024, 3, 10);
        let earliest = NaiveDate::MIN + Days::new(2);
        assert!(matches!(
            resolve_range(None, Some(earliest), today, 7),
            Err(TotalsError::OutOfRange(d)) if d == earliest
        ));
        // An explicit start needs no defaulting
        assert_eq!(
            resolve_range(Some(NaiveDate::MIN), Some(earliest), today, 7).unwrap(),
            (NaiveDate::MIN, earliest)
        );
    }

    #[test]
    fn test_reduce_saturates_message_sums() {
        let records = vec![
            record(1, &[(Category::Messages, names::OUT, u64::MAX - 1)]),
            record(2, &[(Category::Messages, names::OUT, 5)]),
        ];
        let totals = UsageTotals::reduce("T", date(2024, 1, 1), date(2024, 1, 2), &records);
        assert_eq!(totals.messages_out_total, u64::MAX);
    }
}
