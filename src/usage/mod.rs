//! Per-tenant usage metering.
//!
//! - [`UsageCounters`]: in-memory metric trees, written by the aggregator
//! - [`MetricsAggregator`]: samples live state every collection interval
//! - [`FlushPipeline`]: upserts pending counters into daily records
//! - [`UsageTotalsReducer`]: range totals from persisted records only
//! - [`store`]: the durable record store and its backends

mod aggregator;
mod counters;
mod flush;
mod resources;
pub mod store;
mod totals;

pub use aggregator::{LiveStateSource, MetricsAggregator, TenantPresence, TenantTraffic};
pub use counters::{
    names, Category, CategoryTree, Metric, MetricKind, MetricValue, UsageCounters, SYSTEM_TENANT,
};
pub use flush::{FlushPipeline, FlushReport};
pub use resources::{ResourceError, ResourceSample, ResourceSampler, SysinfoSampler};
pub use totals::{resolve_range, TotalsError, UsageTotals, UsageTotalsReducer, MAX_RANGE_DAYS};
