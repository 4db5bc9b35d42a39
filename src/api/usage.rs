//! Usage report endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::server::AppState;
use crate::usage::store::DailyUsageRecord;
use crate::usage::UsageTotals;

#[derive(Debug, Default, Deserialize)]
pub struct UsageRangeQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct SystemUsageResponse {
    pub records: Vec<DailyUsageRecord>,
    pub total: usize,
}

/// GET /api/v1/tenants/{tenant_id}/usage
#[tracing::instrument(name = "api.tenant_usage", skip(state, query))]
pub async fn tenant_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<UsageRangeQuery>,
) -> Result<Json<UsageTotals>, AppError> {
    if tenant_id.trim().is_empty() {
        return Err(AppError::Validation("tenant_id must not be empty".to_string()));
    }

    let totals = state
        .totals
        .get_usage_totals(&tenant_id, query.start, query.end)
        .await?;

    Ok(Json(totals))
}

/// GET /api/v1/system/usage
pub async fn system_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageRangeQuery>,
) -> Result<Json<SystemUsageResponse>, AppError> {
    let records = state.totals.system_usage(query.start, query.end).await?;

    Ok(Json(SystemUsageResponse {
        total: records.len(),
        records,
    }))
}
