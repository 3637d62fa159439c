//! Whitelist CRUD handlers.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use uuid::Uuid;
use validator::Validate;

use crate::dtos::whitelist::{
    CreateWhitelistRequest, UpdateWhitelistRequest, WhitelistListResponse, WhitelistQuery,
    WhitelistResponse,
};
use crate::handlers::context::ClientContext;
use crate::AppState;
use service_core::error::AppError;

/// POST /admin/whitelist
#[tracing::instrument(skip(state, ctx, req))]
pub async fn create_entry(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    Json(req): Json<CreateWhitelistRequest>,
) -> Result<(StatusCode, Json<WhitelistResponse>), AppError> {
    req.validate()?;
    let view = state.whitelist.create(req.into_new_entry(ctx.actor)).await?;
    Ok((StatusCode::CREATED, Json(view.into())))
}

/// GET /admin/whitelist
pub async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<WhitelistQuery>,
) -> Result<Json<WhitelistListResponse>, AppError> {
    let listing = state.whitelist.list(&query.into_filter()).await?;
    Ok(Json(listing.into()))
}

/// GET /admin/whitelist/:id
pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WhitelistResponse>, AppError> {
    let view = state.whitelist.get(id).await?;
    Ok(Json(view.into()))
}

/// PATCH /admin/whitelist/:id
pub async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWhitelistRequest>,
) -> Result<Json<WhitelistResponse>, AppError> {
    req.validate()?;
    let view = state.whitelist.update(id, req.into()).await?;
    Ok(Json(view.into()))
}

/// DELETE /admin/whitelist/:id
pub async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.whitelist.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
