//! Activation code lifecycle: issue, validate, extend, revoke, resend and expire.
//!
//! Each mutation reads a code, applies a transition in memory and persists it with a
//! version-checked write. A lost write reloads the code and re-evaluates from scratch,
//! so concurrent validations against one code serialize on its version column.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::config::CodePolicy;
use crate::models::whitelist_entry::MAX_IDENTIFIER_LEN;
use crate::models::{
    ActivationCode, AuditEvent, AuditEventType, AuditLogEntry, CodeStatus, CodeTransition,
    FailureReason, IdentifierType, RequestContext, RoleProfile, WhitelistEntry,
};
use crate::services::attempt_limiter::{AttemptDecision, AttemptLimiter};
use crate::services::audit::AuditRecorder;
use crate::services::error::{ActivationError, ActivationResult};
use crate::services::hasher::{generate_code, normalize_code, CodeHasher};
use crate::services::mailer::{CodeDelivery, CodeMailer};
use crate::services::metrics;
use crate::services::store::{ActivationRepository, AuditFilter, CodeFilter, CodeSummary, Page};
use crate::services::throttle::ValidationThrottle;

pub const MAX_EXTENSION_HOURS: i64 = 720;
/// Upper bound on reload-and-retry rounds for one version-checked write.
const MAX_WRITE_RETRIES: usize = 64;
const SWEEP_BATCH_SIZE: usize = 500;
const DETAIL_AUDIT_LIMIT: u32 = 50;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub whitelist_id: Uuid,
    pub ttl_hours: Option<i64>,
    pub send_email: bool,
    pub custom_message: Option<String>,
}

/// A freshly issued code. The only place the plaintext ever leaves the engine.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub code_id: Uuid,
    pub whitelist_id: Uuid,
    pub code: SecretString,
    pub expires_at: DateTime<Utc>,
    /// `None` when delivery was not requested.
    pub email_sent: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ValidateRequest {
    pub code: SecretString,
    pub identifier: String,
    pub context: RequestContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivationGrant {
    pub user_id: Uuid,
    pub whitelist_id: Uuid,
    pub code_id: Uuid,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub profile: RoleProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub reason: FailureReason,
    pub remaining_attempts: Option<i32>,
    /// Only one attempt remains before the code locks.
    pub near_limit: bool,
}

/// Expected outcomes of a validation. Failures here are not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Success(ActivationGrant),
    Failure(ValidationFailure),
}

#[derive(Debug, Clone)]
pub struct ExtendResult {
    pub code_id: Uuid,
    pub previous_status: CodeStatus,
    pub status: CodeStatus,
    pub previous_expires_at: DateTime<Utc>,
    pub new_expires_at: DateTime<Utc>,
    pub attempts_reset: bool,
}

#[derive(Debug, Clone)]
pub struct RevokeResult {
    pub code_id: Uuid,
    pub revoked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResendResult {
    pub code_id: Uuid,
    pub email_sent: bool,
    pub code: SecretString,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CodeView {
    pub code: ActivationCode,
    pub entry: Option<WhitelistEntry>,
}

#[derive(Debug, Clone)]
pub struct CodeListing {
    pub codes: Vec<CodeView>,
    pub total: u64,
    pub page: Page,
    pub summary: CodeSummary,
}

#[derive(Debug, Clone)]
pub struct CodeDetail {
    pub view: CodeView,
    pub recent_events: Vec<AuditLogEntry>,
}

fn reason_for(status: CodeStatus) -> FailureReason {
    match status {
        CodeStatus::Used => FailureReason::AlreadyUsed,
        CodeStatus::Revoked => FailureReason::Revoked,
        CodeStatus::Locked => FailureReason::Locked,
        CodeStatus::Expired => FailureReason::Expired,
        CodeStatus::Pending | CodeStatus::Active => FailureReason::InvalidCode,
    }
}

fn contention_error(code_id: Uuid) -> ActivationError {
    ActivationError::Infra(anyhow::anyhow!(
        "Gave up writing activation code {} after {} concurrent modifications",
        code_id,
        MAX_WRITE_RETRIES
    ))
}

#[derive(Clone)]
pub struct ActivationEngine {
    repo: Arc<dyn ActivationRepository>,
    hasher: CodeHasher,
    audit: AuditRecorder,
    throttle: ValidationThrottle,
    mailer: Arc<dyn CodeMailer>,
    policy: CodePolicy,
}

impl ActivationEngine {
    pub fn new(
        repo: Arc<dyn ActivationRepository>,
        hasher: CodeHasher,
        audit: AuditRecorder,
        throttle: ValidationThrottle,
        mailer: Arc<dyn CodeMailer>,
        policy: CodePolicy,
    ) -> Self {
        Self {
            repo,
            hasher,
            audit,
            throttle,
            mailer,
            policy,
        }
    }

    pub fn policy(&self) -> &CodePolicy {
        &self.policy
    }

    async fn load_code(&self, code_id: Uuid) -> ActivationResult<ActivationCode> {
        self.repo
            .find_code(code_id)
            .await?
            .ok_or_else(|| ActivationError::not_found("Activation code"))
    }

    async fn load_entry(&self, whitelist_id: Uuid) -> ActivationResult<WhitelistEntry> {
        self.repo
            .find_entry(whitelist_id)
            .await?
            .ok_or_else(|| ActivationError::not_found("Whitelist entry"))
    }

    async fn deliver(
        &self,
        entry: &WhitelistEntry,
        code: &SecretString,
        expires_at: DateTime<Utc>,
        custom_message: Option<&str>,
    ) -> Result<(), String> {
        if entry.identifier_type != IdentifierType::Email {
            return Err("Whitelist identifier is not an email address".to_string());
        }

        self.mailer
            .send_activation_code(CodeDelivery {
                to_email: &entry.identifier,
                full_name: &entry.full_name,
                code,
                expires_at,
                custom_message,
            })
            .await
    }

    /// Issue a new code for a whitelist entry.
    #[tracing::instrument(skip(self, request, context), fields(whitelist_id = %request.whitelist_id))]
    pub async fn generate(
        &self,
        request: GenerateRequest,
        context: &RequestContext,
    ) -> ActivationResult<GeneratedCode> {
        let ttl_hours = request.ttl_hours.unwrap_or(self.policy.default_ttl_hours);
        if ttl_hours < self.policy.min_ttl_hours || ttl_hours > self.policy.max_ttl_hours {
            return Err(ActivationError::Validation(format!(
                "ttl_hours must be between {} and {}",
                self.policy.min_ttl_hours, self.policy.max_ttl_hours
            )));
        }

        let entry = self.load_entry(request.whitelist_id).await?;
        if entry.is_activated {
            return Err(ActivationError::Conflict(
                "Whitelist entry is already activated".to_string(),
            ));
        }

        let now = Utc::now();
        for code in self.repo.codes_for_entry(entry.id).await? {
            if code.is_overdue(now) {
                self.expire_code(code, context).await?;
            } else if code.is_live(now) {
                return Err(ActivationError::Conflict(
                    "Whitelist entry already has a live activation code; revoke it first"
                        .to_string(),
                ));
            }
        }

        let plaintext = generate_code();
        let code_hash = self.hasher.hash(&plaintext).await?;
        let expires_at = now + Duration::hours(ttl_hours);
        let code = ActivationCode::new(entry.id, code_hash, expires_at, self.policy.max_attempts, now);
        self.repo.insert_code(&code).await?;

        self.audit
            .record(
                AuditEvent::new(AuditEventType::CodeGenerated)
                    .code(code.id)
                    .whitelist(entry.id)
                    .identifier(entry.identifier.clone())
                    .meta("ttl_hours", ttl_hours)
                    .meta("expires_at", expires_at.to_rfc3339())
                    .meta("max_attempts", code.max_attempts)
                    .context(context),
            )
            .await;
        metrics::record_code_generated();
        tracing::info!(code_id = %code.id, %expires_at, "Activation code generated");

        let email_sent = if request.send_email {
            let delivery = self
                .deliver(&entry, &plaintext, expires_at, request.custom_message.as_deref())
                .await;
            let mut event = AuditEvent::new(AuditEventType::EmailSent)
                .code(code.id)
                .whitelist(entry.id)
                .identifier(entry.identifier.clone())
                .context(context);
            if let Err(error) = &delivery {
                event.success = false;
                event = event.meta("error", error.clone());
            }
            self.audit.record(event).await;
            Some(delivery.is_ok())
        } else {
            None
        };

        Ok(GeneratedCode {
            code_id: code.id,
            whitelist_id: entry.id,
            code: plaintext,
            expires_at,
            email_sent,
        })
    }

    /// Redeem a code for an identifier. Expected failures come back as
    /// [`ValidationOutcome::Failure`]; only throttling, malformed input and
    /// infrastructure faults are errors.
    #[tracing::instrument(skip(self, request), fields(ip = ?request.context.ip_address))]
    pub async fn validate(&self, request: ValidateRequest) -> ActivationResult<ValidationOutcome> {
        let context = &request.context;
        let identifier = request.identifier.trim();

        if let Err(rejection) = self.throttle.check(context.ip_address.as_deref(), identifier) {
            let retry_after_secs = rejection.retry_after.as_secs().max(1);
            self.audit
                .record(
                    AuditEvent::new(AuditEventType::RateLimitExceeded)
                        .identifier(identifier)
                        .failed(FailureReason::RateLimited)
                        .meta("scope", rejection.scope.as_str())
                        .meta("retry_after_secs", retry_after_secs)
                        .context(context),
                )
                .await;
            metrics::record_validation(Some(FailureReason::RateLimited));
            tracing::warn!(scope = rejection.scope.as_str(), "Activation validation throttled");
            return Err(ActivationError::RateLimited { retry_after_secs });
        }

        let identifier_ok = !identifier.is_empty() && identifier.len() <= MAX_IDENTIFIER_LEN;
        let normalized = match normalize_code(request.code.expose_secret()) {
            Some(normalized) if identifier_ok => normalized,
            _ => {
                let attempted: String = identifier.chars().take(MAX_IDENTIFIER_LEN).collect();
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::ActivationFailed)
                            .identifier(attempted)
                            .failed(FailureReason::InvalidCode)
                            .meta("malformed", true)
                            .context(context),
                    )
                    .await;
                metrics::record_validation(Some(FailureReason::InvalidCode));
                return Err(ActivationError::Validation(
                    "Activation code or identifier is malformed".to_string(),
                ));
            }
        };

        let Some(entry) = self.repo.find_entry_by_identifier(identifier).await? else {
            self.hasher.burn(&normalized).await?;
            return Ok(self
                .fail(FailureReason::NotFound, None, None, identifier, None, context)
                .await);
        };

        if entry.is_activated {
            self.hasher.burn(&normalized).await?;
            return Ok(self
                .fail(FailureReason::AlreadyUsed, Some(&entry), None, identifier, None, context)
                .await);
        }

        let now = Utc::now();
        let codes = self.repo.codes_for_entry(entry.id).await?;
        let live: Vec<ActivationCode> = codes.iter().filter(|c| c.is_live(now)).cloned().collect();

        if live.is_empty() {
            self.hasher.burn(&normalized).await?;
            let reason = codes
                .first()
                .map_or(FailureReason::NotFound, |c| reason_for(c.effective_status(now)));
            return Ok(self
                .fail(reason, Some(&entry), codes.first(), identifier, None, context)
                .await);
        }

        // Verify every live candidate once; results are reused across write retries.
        let hashes = live.iter().map(|c| c.code_hash.clone()).collect();
        let matched = self.hasher.verify_any(&normalized, hashes).await?;
        let mut verified: HashMap<(Uuid, String), bool> = live
            .iter()
            .enumerate()
            .map(|(idx, c)| ((c.id, c.code_hash.as_str().to_string()), matched == Some(idx)))
            .collect();

        let mut code = match matched {
            Some(idx) => live[idx].clone(),
            None => live[0].clone(),
        };

        for _ in 0..MAX_WRITE_RETRIES {
            let now = Utc::now();
            if !code.is_live(now) {
                let reason = reason_for(code.effective_status(now));
                return Ok(self
                    .fail(reason, Some(&entry), Some(&code), identifier, None, context)
                    .await);
            }

            let key = (code.id, code.code_hash.as_str().to_string());
            let is_match = match verified.get(&key) {
                Some(result) => *result,
                None => {
                    let result = self
                        .hasher
                        .verify_any(&normalized, vec![code.code_hash.clone()])
                        .await?
                        .is_some();
                    verified.insert(key, result);
                    result
                }
            };

            if is_match {
                let user_id = Uuid::new_v4();
                let mut next = code.clone();
                next.apply(CodeTransition::Consume, now)?;

                if self.repo.consume_code(&next, user_id, now).await? {
                    return Ok(self.succeed(&entry, &next, user_id, identifier, context).await);
                }

                let current_entry = self.load_entry(entry.id).await?;
                if current_entry.is_activated {
                    return Ok(self
                        .fail(FailureReason::AlreadyUsed, Some(&entry), Some(&code), identifier, None, context)
                        .await);
                }
            } else {
                let mut next = code.clone();
                next.failed_attempts = (next.failed_attempts + 1).min(next.max_attempts);
                next.updated_at = now;
                let decision = AttemptLimiter::evaluate(next.failed_attempts, next.max_attempts);
                if decision.is_lock() {
                    next.apply(CodeTransition::Lock, now)?;
                }

                if self.repo.update_code(&next).await? {
                    return Ok(self
                        .record_mismatch(&entry, &next, decision, identifier, context)
                        .await);
                }
            }

            code = self.load_code(code.id).await?;
        }

        Err(contention_error(code.id))
    }

    async fn succeed(
        &self,
        entry: &WhitelistEntry,
        code: &ActivationCode,
        user_id: Uuid,
        identifier: &str,
        context: &RequestContext,
    ) -> ValidationOutcome {
        self.audit
            .record(
                AuditEvent::new(AuditEventType::ActivationSuccess)
                    .code(code.id)
                    .whitelist(entry.id)
                    .identifier(identifier)
                    .created_user(user_id)
                    .meta("assigned_role", entry.assigned_role.clone())
                    .context(context),
            )
            .await;
        metrics::record_validation(None);
        tracing::info!(code_id = %code.id, whitelist_id = %entry.id, %user_id, "Account activated");

        ValidationOutcome::Success(ActivationGrant {
            user_id,
            whitelist_id: entry.id,
            code_id: code.id,
            identifier: entry.identifier.clone(),
            identifier_type: entry.identifier_type,
            profile: entry.role_profile(),
        })
    }

    async fn record_mismatch(
        &self,
        entry: &WhitelistEntry,
        code: &ActivationCode,
        decision: AttemptDecision,
        identifier: &str,
        context: &RequestContext,
    ) -> ValidationOutcome {
        let remaining = decision.remaining();
        let outcome = self
            .fail(
                FailureReason::InvalidCode,
                Some(entry),
                Some(code),
                identifier,
                Some(decision),
                context,
            )
            .await;

        if decision.is_lock() {
            self.audit
                .record(
                    AuditEvent::new(AuditEventType::CodeLocked)
                        .code(code.id)
                        .whitelist(entry.id)
                        .identifier(identifier)
                        .meta("failed_attempts", code.failed_attempts)
                        .meta("max_attempts", code.max_attempts)
                        .context(context),
                )
                .await;
            metrics::record_code_locked();
            tracing::warn!(code_id = %code.id, whitelist_id = %entry.id, "Activation code locked after repeated failures");
        } else if matches!(decision, AttemptDecision::WarnNearLimit { .. }) {
            tracing::warn!(code_id = %code.id, remaining, "Activation code one failure away from lockout");
        }

        outcome
    }

    async fn fail(
        &self,
        reason: FailureReason,
        entry: Option<&WhitelistEntry>,
        code: Option<&ActivationCode>,
        identifier: &str,
        decision: Option<AttemptDecision>,
        context: &RequestContext,
    ) -> ValidationOutcome {
        let remaining_attempts = decision.map(|d| d.remaining());
        let near_limit = matches!(decision, Some(AttemptDecision::WarnNearLimit { .. }));

        let mut event = AuditEvent::new(AuditEventType::ActivationFailed)
            .identifier(identifier)
            .failed(reason)
            .context(context);
        if let Some(entry) = entry {
            event = event.whitelist(entry.id);
        }
        if let Some(code) = code {
            event = event.code(code.id).meta("code_status", code.status.as_str());
        }
        if let Some(remaining) = remaining_attempts {
            event = event.meta("remaining_attempts", remaining);
        }
        self.audit.record(event).await;
        metrics::record_validation(Some(reason));

        ValidationOutcome::Failure(ValidationFailure {
            reason,
            remaining_attempts,
            near_limit,
        })
    }

    /// Push out a code's expiry, reviving it if expired (or locked, when policy allows).
    #[tracing::instrument(skip(self, context))]
    pub async fn extend(
        &self,
        code_id: Uuid,
        additional_hours: i64,
        reset_attempts: bool,
        context: &RequestContext,
    ) -> ActivationResult<ExtendResult> {
        if !(1..=MAX_EXTENSION_HOURS).contains(&additional_hours) {
            return Err(ActivationError::Validation(format!(
                "additional_hours must be between 1 and {}",
                MAX_EXTENSION_HOURS
            )));
        }

        for _ in 0..MAX_WRITE_RETRIES {
            let code = self.load_code(code_id).await?;
            let now = Utc::now();
            let mut next = code.clone();
            let mut attempts_reset = false;

            match code.status {
                CodeStatus::Used | CodeStatus::Revoked => {
                    return Err(ActivationError::InvalidState(format!(
                        "Cannot extend a code that is {}",
                        code.status
                    )));
                }
                CodeStatus::Locked => {
                    if !(self.policy.allow_unlock_on_extend && reset_attempts) {
                        return Err(ActivationError::InvalidState(
                            "Code is locked; extending it requires unlock-on-extend to be enabled and reset_attempts=true"
                                .to_string(),
                        ));
                    }
                    next.failed_attempts = 0;
                    attempts_reset = true;
                    next.apply(CodeTransition::Revive, now)?;
                }
                CodeStatus::Expired => {
                    next.apply(CodeTransition::Revive, now)?;
                }
                CodeStatus::Pending | CodeStatus::Active => {}
            }

            if next.status != code.status {
                let entry = self.load_entry(code.whitelist_id).await?;
                if entry.is_activated {
                    return Err(ActivationError::InvalidState(
                        "Whitelist entry is already activated".to_string(),
                    ));
                }
                let other_live = self
                    .repo
                    .codes_for_entry(code.whitelist_id)
                    .await?
                    .iter()
                    .any(|c| c.id != code.id && c.is_live(now));
                if other_live {
                    return Err(ActivationError::Conflict(
                        "Another live activation code exists for this whitelist entry".to_string(),
                    ));
                }
            }

            let base = code.expires_at.max(now);
            next.expires_at = base + Duration::hours(additional_hours);
            next.updated_at = now;

            if !self.repo.update_code(&next).await? {
                continue;
            }

            self.audit
                .record(
                    AuditEvent::new(AuditEventType::CodeExtended)
                        .code(code.id)
                        .whitelist(code.whitelist_id)
                        .meta("previous_expires_at", code.expires_at.to_rfc3339())
                        .meta("new_expires_at", next.expires_at.to_rfc3339())
                        .meta("previous_status", code.status.as_str())
                        .meta("additional_hours", additional_hours)
                        .meta("reset_attempts", attempts_reset)
                        .context(context),
                )
                .await;
            tracing::info!(%code_id, new_expires_at = %next.expires_at, "Activation code extended");

            return Ok(ExtendResult {
                code_id,
                previous_status: code.status,
                status: next.status,
                previous_expires_at: code.expires_at,
                new_expires_at: next.expires_at,
                attempts_reset,
            });
        }

        Err(contention_error(code_id))
    }

    /// Permanently revoke a code. The whitelist entry is left untouched.
    #[tracing::instrument(skip(self, reason, context))]
    pub async fn revoke(
        &self,
        code_id: Uuid,
        reason: &str,
        context: &RequestContext,
    ) -> ActivationResult<RevokeResult> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ActivationError::Validation(
                "A revocation reason is required".to_string(),
            ));
        }

        for _ in 0..MAX_WRITE_RETRIES {
            let code = self.load_code(code_id).await?;
            let now = Utc::now();
            let mut next = code.clone();
            next.apply(CodeTransition::Revoke, now)?;
            next.revoke_reason = Some(reason.to_string());

            if !self.repo.update_code(&next).await? {
                continue;
            }

            self.audit
                .record(
                    AuditEvent::new(AuditEventType::CodeRevoked)
                        .code(code.id)
                        .whitelist(code.whitelist_id)
                        .meta("reason", reason)
                        .meta("previous_status", code.status.as_str())
                        .context(context),
                )
                .await;
            tracing::info!(%code_id, previous_status = %code.status, "Activation code revoked");

            return Ok(RevokeResult {
                code_id,
                revoked_at: now,
            });
        }

        Err(contention_error(code_id))
    }

    /// Rotate the secret of a live code and deliver the new plaintext. Counters and
    /// expiry are unchanged.
    #[tracing::instrument(skip(self, custom_message, context))]
    pub async fn resend(
        &self,
        code_id: Uuid,
        custom_message: Option<&str>,
        context: &RequestContext,
    ) -> ActivationResult<ResendResult> {
        for _ in 0..MAX_WRITE_RETRIES {
            let code = self.load_code(code_id).await?;
            let now = Utc::now();
            if !code.is_live(now) {
                return Err(ActivationError::InvalidState(format!(
                    "Only live codes can be resent; code is {}",
                    code.effective_status(now)
                )));
            }

            let entry = self.load_entry(code.whitelist_id).await?;
            if entry.identifier_type != IdentifierType::Email {
                return Err(ActivationError::Validation(
                    "Whitelist entry has no email identifier to deliver to".to_string(),
                ));
            }

            let plaintext = generate_code();
            let mut next = code.clone();
            next.code_hash = self.hasher.hash(&plaintext).await?;
            next.updated_at = now;

            if !self.repo.update_code(&next).await? {
                continue;
            }

            let delivery = self
                .deliver(&entry, &plaintext, code.expires_at, custom_message)
                .await;
            let mut event = AuditEvent::new(AuditEventType::EmailResent)
                .code(code.id)
                .whitelist(entry.id)
                .identifier(entry.identifier.clone())
                .meta("secret_rotated", true)
                .context(context);
            if let Err(error) = &delivery {
                event.success = false;
                event = event.meta("error", error.clone());
            }
            self.audit.record(event).await;

            return Ok(ResendResult {
                code_id,
                email_sent: delivery.is_ok(),
                code: plaintext,
                expires_at: code.expires_at,
            });
        }

        Err(contention_error(code_id))
    }

    /// Persist the expiry of an overdue active code. Emits `code_expired` only from the
    /// writer that wins the transition.
    async fn expire_code(
        &self,
        mut code: ActivationCode,
        context: &RequestContext,
    ) -> ActivationResult<bool> {
        for _ in 0..MAX_WRITE_RETRIES {
            let now = Utc::now();
            if !code.is_overdue(now) {
                return Ok(false);
            }

            let mut next = code.clone();
            next.apply(CodeTransition::Expire, now)?;
            if self.repo.update_code(&next).await? {
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::CodeExpired)
                            .code(code.id)
                            .whitelist(code.whitelist_id)
                            .meta("expired_at", code.expires_at.to_rfc3339())
                            .context(context),
                    )
                    .await;
                return Ok(true);
            }

            match self.repo.find_code(code.id).await? {
                Some(reloaded) => code = reloaded,
                None => return Ok(false),
            }
        }

        Err(contention_error(code.id))
    }

    /// Expire every overdue active code. Returns how many this call transitioned.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> ActivationResult<u64> {
        let context = RequestContext {
            actor: Some("expiry-sweeper".to_string()),
            ..Default::default()
        };

        let mut expired = 0u64;
        loop {
            let overdue = self.repo.overdue_codes(Utc::now(), SWEEP_BATCH_SIZE).await?;
            let batch_len = overdue.len();
            let mut progressed = false;
            for code in overdue {
                if self.expire_code(code, &context).await? {
                    expired += 1;
                    progressed = true;
                }
            }
            if batch_len < SWEEP_BATCH_SIZE || !progressed {
                break;
            }
        }

        if expired > 0 {
            metrics::record_codes_expired(expired);
            tracing::info!(expired, "Expired overdue activation codes");
        }
        Ok(expired)
    }

    /// Run [`Self::sweep_expired`] on a fixed interval until the task is aborted.
    /// Each tick also prunes idle keys from the validation throttle.
    pub fn spawn_expiry_sweeper(self: Arc<Self>, every: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired().await {
                    tracing::error!(error = %e, "Expiry sweep failed");
                }
                let tracked = self.throttle.prune();
                tracing::debug!(tracked, "Pruned validation throttle");
            }
        })
    }

    pub async fn list_codes(&self, filter: &CodeFilter) -> ActivationResult<CodeListing> {
        let now = Utc::now();
        let (codes, total) = self.repo.list_codes(filter, now).await?;
        let summary = self.repo.code_summary(now).await?;

        let ids: Vec<Uuid> = codes.iter().map(|c| c.whitelist_id).collect();
        let entries: HashMap<Uuid, WhitelistEntry> = self
            .repo
            .find_entries(&ids)
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();

        let codes = codes
            .into_iter()
            .map(|code| CodeView {
                entry: entries.get(&code.whitelist_id).cloned(),
                code,
            })
            .collect();

        Ok(CodeListing {
            codes,
            total,
            page: filter.page,
            summary,
        })
    }

    pub async fn code_detail(&self, code_id: Uuid) -> ActivationResult<CodeDetail> {
        let code = self.load_code(code_id).await?;
        let entry = self.repo.find_entry(code.whitelist_id).await?;
        let audit = self
            .audit
            .query(&AuditFilter {
                activation_code_id: Some(code_id),
                page: Page::new(Some(1), Some(DETAIL_AUDIT_LIMIT)),
                ..Default::default()
            })
            .await?;

        Ok(CodeDetail {
            view: CodeView { code, entry },
            recent_events: audit.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_for_terminal_statuses() {
        assert_eq!(reason_for(CodeStatus::Used), FailureReason::AlreadyUsed);
        assert_eq!(reason_for(CodeStatus::Revoked), FailureReason::Revoked);
        assert_eq!(reason_for(CodeStatus::Locked), FailureReason::Locked);
        assert_eq!(reason_for(CodeStatus::Expired), FailureReason::Expired);
    }
}
