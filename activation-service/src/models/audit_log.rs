use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Closed audit event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CodeGenerated,
    CodeExtended,
    CodeValidationAttempt,
    CodeValidationSuccess,
    ActivationAttempt,
    ActivationSuccess,
    ActivationFailed,
    CodeRevoked,
    EmailSent,
    EmailResent,
    CodeExpired,
    CodeLocked,
    RateLimitExceeded,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 13] = [
        AuditEventType::CodeGenerated,
        AuditEventType::CodeExtended,
        AuditEventType::CodeValidationAttempt,
        AuditEventType::CodeValidationSuccess,
        AuditEventType::ActivationAttempt,
        AuditEventType::ActivationSuccess,
        AuditEventType::ActivationFailed,
        AuditEventType::CodeRevoked,
        AuditEventType::EmailSent,
        AuditEventType::EmailResent,
        AuditEventType::CodeExpired,
        AuditEventType::CodeLocked,
        AuditEventType::RateLimitExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CodeGenerated => "code_generated",
            AuditEventType::CodeExtended => "code_extended",
            AuditEventType::CodeValidationAttempt => "code_validation_attempt",
            AuditEventType::CodeValidationSuccess => "code_validation_success",
            AuditEventType::ActivationAttempt => "activation_attempt",
            AuditEventType::ActivationSuccess => "activation_success",
            AuditEventType::ActivationFailed => "activation_failed",
            AuditEventType::CodeRevoked => "code_revoked",
            AuditEventType::EmailSent => "email_sent",
            AuditEventType::EmailResent => "email_resent",
            AuditEventType::CodeExpired => "code_expired",
            AuditEventType::CodeLocked => "code_locked",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Events that represent an end-user attempt to redeem a code.
    pub fn is_attempt(&self) -> bool {
        matches!(
            self,
            AuditEventType::CodeValidationAttempt
                | AuditEventType::CodeValidationSuccess
                | AuditEventType::ActivationAttempt
                | AuditEventType::ActivationSuccess
                | AuditEventType::ActivationFailed
        )
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a validation attempt did not activate an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidCode,
    Expired,
    AlreadyUsed,
    Revoked,
    NotFound,
    Locked,
    RateLimited,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidCode => "invalid_code",
            FailureReason::Expired => "expired",
            FailureReason::AlreadyUsed => "already_used",
            FailureReason::Revoked => "revoked",
            FailureReason::NotFound => "not_found",
            FailureReason::Locked => "locked",
            FailureReason::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invalid_code" => Some(FailureReason::InvalidCode),
            "expired" => Some(FailureReason::Expired),
            "already_used" => Some(FailureReason::AlreadyUsed),
            "revoked" => Some(FailureReason::Revoked),
            "not_found" => Some(FailureReason::NotFound),
            "locked" => Some(FailureReason::Locked),
            "rate_limited" => Some(FailureReason::RateLimited),
            _ => None,
        }
    }
}

/// Client context captured from the inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub request_id: Option<String>,
    /// Operator performing an admin action, if known.
    pub actor: Option<String>,
}

impl RequestContext {
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip.into()),
            ..Default::default()
        }
    }
}

/// Immutable audit record. Never updated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub activation_code_id: Option<Uuid>,
    pub whitelist_id: Option<Uuid>,
    pub identifier_attempted: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
    pub created_user_id: Option<Uuid>,
    pub request_metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// An audit event before the recorder stamps id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub activation_code_id: Option<Uuid>,
    pub whitelist_id: Option<Uuid>,
    pub identifier_attempted: Option<String>,
    pub success: bool,
    pub failure_reason: Option<FailureReason>,
    pub created_user_id: Option<Uuid>,
    pub metadata: Map<String, Value>,
    pub context: RequestContext,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            activation_code_id: None,
            whitelist_id: None,
            identifier_attempted: None,
            success: true,
            failure_reason: None,
            created_user_id: None,
            metadata: Map::new(),
            context: RequestContext::default(),
        }
    }

    pub fn code(mut self, code_id: Uuid) -> Self {
        self.activation_code_id = Some(code_id);
        self
    }

    pub fn whitelist(mut self, whitelist_id: Uuid) -> Self {
        self.whitelist_id = Some(whitelist_id);
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier_attempted = Some(identifier.into());
        self
    }

    pub fn failed(mut self, reason: FailureReason) -> Self {
        self.success = false;
        self.failure_reason = Some(reason);
        self
    }

    pub fn created_user(mut self, user_id: Uuid) -> Self {
        self.created_user_id = Some(user_id);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn context(mut self, context: &RequestContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn into_entry(self, created_at: DateTime<Utc>) -> AuditLogEntry {
        let mut metadata = self.metadata;
        if let Some(request_id) = self.context.request_id {
            metadata
                .entry("request_id")
                .or_insert(Value::String(request_id));
        }
        if let Some(actor) = self.context.actor {
            metadata.entry("actor").or_insert(Value::String(actor));
        }

        AuditLogEntry {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            activation_code_id: self.activation_code_id,
            whitelist_id: self.whitelist_id,
            identifier_attempted: self.identifier_attempted,
            ip_address: self.context.ip_address,
            user_agent: self.context.user_agent,
            device_id: self.context.device_id,
            success: self.success,
            failure_reason: self.failure_reason,
            created_user_id: self.created_user_id,
            request_metadata: Value::Object(metadata),
            created_at,
        }
    }
}
