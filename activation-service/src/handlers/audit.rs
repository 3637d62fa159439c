use axum::extract::{Json, Query, State};

use crate::dtos::audit::{AuditListResponse, AuditQuery};
use crate::services::ActivationStats;
use crate::AppState;
use service_core::error::AppError;

/// GET /admin/activation-audit
pub async fn query_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditListResponse>, AppError> {
    let filter = query.into_filter();
    if let (Some(from), Some(to)) = (filter.from, filter.to) {
        if from > to {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "date_from must not be after date_to"
            )));
        }
    }

    let page = state.audit.query(&filter).await?;
    Ok(Json(AuditListResponse::from_page(page, filter.page)))
}

/// GET /admin/activation-audit/stats
pub async fn activation_stats(
    State(state): State<AppState>,
) -> Result<Json<ActivationStats>, AppError> {
    Ok(Json(state.stats.collect().await?))
}
