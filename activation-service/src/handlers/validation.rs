use axum::extract::{Json, State};
use validator::Validate;

use crate::dtos::activation::{ValidateCodeRequest, ValidateCodeResponse};
use crate::handlers::context::ClientContext;
use crate::models::RequestContext;
use crate::services::ValidateRequest;
use crate::AppState;
use service_core::error::AppError;

/// Redeem a code - implementation.
///
/// Expected failures (wrong code, expired, locked, ...) are a successful response with
/// `success: false`. Only throttling, malformed input and infrastructure faults are errors.
pub async fn validate_code_impl(
    state: &AppState,
    req: ValidateCodeRequest,
    mut ctx: RequestContext,
) -> Result<ValidateCodeResponse, AppError> {
    req.validate()?;
    ctx.device_id = req.device_id.clone();

    let outcome = state
        .engine
        .validate(ValidateRequest {
            code: req.secret_code(),
            identifier: req.identifier,
            context: ctx,
        })
        .await?;

    Ok(outcome.into())
}

/// POST /activation/validate
pub async fn validate_code(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    Json(req): Json<ValidateCodeRequest>,
) -> Result<Json<ValidateCodeResponse>, AppError> {
    validate_code_impl(&state, req, ctx).await.map(Json)
}
