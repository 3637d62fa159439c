use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::dtos::audit::AuditLogResponse;
use crate::dtos::PageMeta;
use crate::models::{CodeStatus, FailureReason, IdentifierType, RoleProfile};
use crate::services::{
    CodeDetail, CodeFilter, CodeListing, CodeSummary, CodeView, ExtendResult, GeneratedCode,
    Page, ResendResult, RevokeResult, ValidationOutcome,
};

#[derive(Debug, Deserialize, Validate)]
pub struct GenerateCodeRequest {
    pub whitelist_id: Uuid,
    /// Falls back to the configured default TTL.
    pub ttl_hours: Option<i64>,
    #[serde(default)]
    pub send_email: bool,
    #[validate(length(max = 2000, message = "Custom message must be at most 2000 characters"))]
    pub custom_message: Option<String>,
}

/// The plaintext code appears here and in [`ResendCodeResponse`] only.
#[derive(Debug, Serialize)]
pub struct GenerateCodeResponse {
    pub code_id: Uuid,
    pub whitelist_id: Uuid,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_sent: Option<bool>,
}

impl From<GeneratedCode> for GenerateCodeResponse {
    fn from(generated: GeneratedCode) -> Self {
        Self {
            code_id: generated.code_id,
            whitelist_id: generated.whitelist_id,
            code: generated.code.expose_secret().clone(),
            expires_at: generated.expires_at,
            email_sent: generated.email_sent,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListCodesQuery {
    pub status: Option<CodeStatus>,
    pub whitelist_id: Option<Uuid>,
    pub expiring_soon: Option<bool>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListCodesQuery {
    pub fn into_filter(self) -> CodeFilter {
        CodeFilter {
            status: self.status,
            whitelist_id: self.whitelist_id,
            expiring_soon: self.expiring_soon.unwrap_or(false),
            page: Page::new(self.page, self.page_size),
        }
    }
}

/// Admin view of a code. Never carries hash material.
#[derive(Debug, Serialize)]
pub struct CodeResponse {
    pub id: Uuid,
    pub whitelist_id: Uuid,
    pub identifier: Option<String>,
    pub full_name: Option<String>,
    /// Effective status: an overdue active code reads as expired.
    pub status: CodeStatus,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
    pub failed_attempts: i32,
    pub max_attempts: i32,
    pub remaining_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeResponse {
    pub fn from_view(view: CodeView, now: DateTime<Utc>) -> Self {
        let CodeView { code, entry } = view;
        Self {
            id: code.id,
            whitelist_id: code.whitelist_id,
            identifier: entry.as_ref().map(|e| e.identifier.clone()),
            full_name: entry.map(|e| e.full_name),
            status: code.effective_status(now),
            expires_at: code.expires_at,
            used_at: code.used_at,
            revoked_at: code.revoked_at,
            revoke_reason: code.revoke_reason.clone(),
            failed_attempts: code.failed_attempts,
            max_attempts: code.max_attempts,
            remaining_attempts: code.remaining_attempts(),
            created_at: code.created_at,
            updated_at: code.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CodeListResponse {
    pub codes: Vec<CodeResponse>,
    #[serde(flatten)]
    pub pagination: PageMeta,
    pub summary: CodeSummary,
}

impl CodeListResponse {
    pub fn from_listing(listing: CodeListing, now: DateTime<Utc>) -> Self {
        Self {
            pagination: PageMeta::new(listing.page, listing.total),
            codes: listing
                .codes
                .into_iter()
                .map(|view| CodeResponse::from_view(view, now))
                .collect(),
            summary: listing.summary,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CodeDetailResponse {
    pub code: CodeResponse,
    pub recent_events: Vec<AuditLogResponse>,
}

impl CodeDetailResponse {
    pub fn from_detail(detail: CodeDetail, now: DateTime<Utc>) -> Self {
        Self {
            code: CodeResponse::from_view(detail.view, now),
            recent_events: detail.recent_events.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExtendCodeRequest {
    pub additional_hours: i64,
    /// Required to unlock a locked code, and only honored when unlock-on-extend is enabled.
    #[serde(default)]
    pub reset_attempts: bool,
}

#[derive(Debug, Serialize)]
pub struct ExtendCodeResponse {
    pub code_id: Uuid,
    pub previous_status: CodeStatus,
    pub status: CodeStatus,
    pub previous_expires_at: DateTime<Utc>,
    pub new_expires_at: DateTime<Utc>,
    pub attempts_reset: bool,
}

impl From<ExtendResult> for ExtendCodeResponse {
    fn from(result: ExtendResult) -> Self {
        Self {
            code_id: result.code_id,
            previous_status: result.previous_status,
            status: result.status,
            previous_expires_at: result.previous_expires_at,
            new_expires_at: result.new_expires_at,
            attempts_reset: result.attempts_reset,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RevokeCodeRequest {
    #[validate(length(min = 1, max = 500, message = "Reason must be 1-500 characters"))]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeCodeResponse {
    pub code_id: Uuid,
    pub status: CodeStatus,
    pub revoked_at: DateTime<Utc>,
}

impl From<RevokeResult> for RevokeCodeResponse {
    fn from(result: RevokeResult) -> Self {
        Self {
            code_id: result.code_id,
            status: CodeStatus::Revoked,
            revoked_at: result.revoked_at,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ResendCodeRequest {
    #[validate(length(max = 2000, message = "Custom message must be at most 2000 characters"))]
    pub custom_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResendCodeResponse {
    pub success: bool,
    pub code_id: Uuid,
    pub email_sent: bool,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl From<ResendResult> for ResendCodeResponse {
    fn from(result: ResendResult) -> Self {
        Self {
            success: true,
            code_id: result.code_id,
            email_sent: result.email_sent,
            code: result.code.expose_secret().clone(),
            expires_at: result.expires_at,
        }
    }
}

/// Code and identifier shape is checked by the engine so rejected attempts are still audited.
#[derive(Deserialize, Validate)]
pub struct ValidateCodeRequest {
    pub code: String,
    pub identifier: String,
    #[validate(length(max = 200))]
    pub device_id: Option<String>,
}

impl ValidateCodeRequest {
    pub fn secret_code(&self) -> SecretString {
        SecretString::new(self.code.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct ValidateCodeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whitelist_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_type: Option<IdentifierType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<RoleProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<i32>,
    pub near_limit: bool,
    pub message: String,
}

fn failure_message(reason: FailureReason) -> &'static str {
    match reason {
        FailureReason::InvalidCode => "The activation code is incorrect",
        FailureReason::Expired => "The activation code has expired",
        FailureReason::AlreadyUsed => "This account has already been activated",
        FailureReason::Revoked => "The activation code has been revoked",
        FailureReason::NotFound => "No activation code was found for this identifier",
        FailureReason::Locked => "The activation code is locked after too many failed attempts",
        FailureReason::RateLimited => "Too many activation attempts. Please try again later.",
    }
}

impl From<ValidationOutcome> for ValidateCodeResponse {
    fn from(outcome: ValidationOutcome) -> Self {
        match outcome {
            ValidationOutcome::Success(grant) => Self {
                success: true,
                user_id: Some(grant.user_id),
                whitelist_id: Some(grant.whitelist_id),
                identifier: Some(grant.identifier),
                identifier_type: Some(grant.identifier_type),
                profile: Some(grant.profile),
                failure_reason: None,
                remaining_attempts: None,
                near_limit: false,
                message: "Account activated".to_string(),
            },
            ValidationOutcome::Failure(failure) => Self {
                success: false,
                user_id: None,
                whitelist_id: None,
                identifier: None,
                identifier_type: None,
                profile: None,
                failure_reason: Some(failure.reason),
                remaining_attempts: failure.remaining_attempts,
                near_limit: failure.near_limit,
                message: failure_message(failure.reason).to_string(),
            },
        }
    }
}
