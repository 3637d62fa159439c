//! Admin activation code handlers.
//!
//! - Generate a code for a whitelist entry (plaintext returned once)
//! - List and inspect codes
//! - Extend, revoke and resend

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::activation::{
    CodeDetailResponse, CodeListResponse, ExtendCodeRequest, ExtendCodeResponse,
    GenerateCodeRequest, GenerateCodeResponse, ListCodesQuery, ResendCodeRequest,
    ResendCodeResponse, RevokeCodeRequest, RevokeCodeResponse,
};
use crate::handlers::context::ClientContext;
use crate::models::RequestContext;
use crate::services::GenerateRequest;
use crate::AppState;
use service_core::error::AppError;

/// Issue a code - implementation shared with tests and other transports.
#[tracing::instrument(skip(state, req, ctx), fields(whitelist_id = %req.whitelist_id))]
pub async fn generate_code_impl(
    state: &AppState,
    req: GenerateCodeRequest,
    ctx: &RequestContext,
) -> Result<GenerateCodeResponse, AppError> {
    req.validate()?;

    let generated = state
        .engine
        .generate(
            GenerateRequest {
                whitelist_id: req.whitelist_id,
                ttl_hours: req.ttl_hours,
                send_email: req.send_email,
                custom_message: req.custom_message,
            },
            ctx,
        )
        .await?;

    Ok(generated.into())
}

/// POST /admin/activation-codes/generate
pub async fn generate_code(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    Json(req): Json<GenerateCodeRequest>,
) -> Result<(StatusCode, Json<GenerateCodeResponse>), AppError> {
    let response = generate_code_impl(&state, req, &ctx).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /admin/activation-codes
pub async fn list_codes(
    State(state): State<AppState>,
    Query(query): Query<ListCodesQuery>,
) -> Result<Json<CodeListResponse>, AppError> {
    let listing = state.engine.list_codes(&query.into_filter()).await?;
    Ok(Json(CodeListResponse::from_listing(listing, Utc::now())))
}

/// GET /admin/activation-codes/:id
pub async fn get_code(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
) -> Result<Json<CodeDetailResponse>, AppError> {
    let detail = state.engine.code_detail(code_id).await?;
    Ok(Json(CodeDetailResponse::from_detail(detail, Utc::now())))
}

/// POST /admin/activation-codes/:id/extend
pub async fn extend_code(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
    ClientContext(ctx): ClientContext,
    Json(req): Json<ExtendCodeRequest>,
) -> Result<Json<ExtendCodeResponse>, AppError> {
    req.validate()?;
    let result = state
        .engine
        .extend(code_id, req.additional_hours, req.reset_attempts, &ctx)
        .await?;
    Ok(Json(result.into()))
}

/// POST /admin/activation-codes/:id/revoke
pub async fn revoke_code(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
    ClientContext(ctx): ClientContext,
    Json(req): Json<RevokeCodeRequest>,
) -> Result<Json<RevokeCodeResponse>, AppError> {
    req.validate()?;
    let result = state.engine.revoke(code_id, &req.reason, &ctx).await?;
    Ok(Json(result.into()))
}

/// POST /admin/activation-codes/:id/resend-email
///
/// The body is optional.
pub async fn resend_code(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
    ClientContext(ctx): ClientContext,
    req: Option<Json<ResendCodeRequest>>,
) -> Result<Json<ResendCodeResponse>, AppError> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    req.validate()?;
    let result = state
        .engine
        .resend(code_id, req.custom_message.as_deref(), &ctx)
        .await?;
    Ok(Json(result.into()))
}
