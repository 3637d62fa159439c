//! Activation code model and its lifecycle state machine.
//!
//! A code moves through a closed set of statuses. Every mutation goes through
//! [`ActivationCode::apply`], which consults [`next_status`]; there is no other way to
//! change a code's status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::services::hasher::CodeHash;

/// Activation code status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    Pending,
    Active,
    Used,
    Expired,
    Revoked,
    Locked,
}

impl CodeStatus {
    pub const ALL: [CodeStatus; 6] = [
        CodeStatus::Pending,
        CodeStatus::Active,
        CodeStatus::Used,
        CodeStatus::Expired,
        CodeStatus::Revoked,
        CodeStatus::Locked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Pending => "pending",
            CodeStatus::Active => "active",
            CodeStatus::Used => "used",
            CodeStatus::Expired => "expired",
            CodeStatus::Revoked => "revoked",
            CodeStatus::Locked => "locked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CodeStatus::Pending),
            "active" => Some(CodeStatus::Active),
            "used" => Some(CodeStatus::Used),
            "expired" => Some(CodeStatus::Expired),
            "revoked" => Some(CodeStatus::Revoked),
            "locked" => Some(CodeStatus::Locked),
            _ => None,
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CodeStatus::Used | CodeStatus::Revoked)
    }
}

impl std::fmt::Display for CodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeTransition {
    /// pending code becomes redeemable
    Activate,
    /// correct code presented
    Consume,
    /// expiry time passed
    Expire,
    /// failed-attempt ceiling reached
    Lock,
    /// operator revocation
    Revoke,
    /// operator extension of an expired or locked code
    Revive,
}

impl CodeTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeTransition::Activate => "activate",
            CodeTransition::Consume => "consume",
            CodeTransition::Expire => "expire",
            CodeTransition::Lock => "lock",
            CodeTransition::Revoke => "revoke",
            CodeTransition::Revive => "revive",
        }
    }
}

/// The transition table. `None` means the trigger is not permitted from `from`.
pub fn next_status(from: CodeStatus, transition: CodeTransition) -> Option<CodeStatus> {
    use CodeStatus::*;
    use CodeTransition::*;

    match (from, transition) {
        (Pending, Activate) => Some(Active),
        (Pending, Revoke) => Some(Revoked),
        (Active, Consume) => Some(Used),
        (Active, Expire) => Some(Expired),
        (Active, Lock) => Some(Locked),
        (Active, Revoke) => Some(Revoked),
        (Expired, Revive) => Some(Active),
        (Expired, Revoke) => Some(Revoked),
        (Locked, Revive) => Some(Active),
        (Locked, Revoke) => Some(Revoked),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {} a code that is {from}", transition.as_str())]
pub struct InvalidTransition {
    pub from: CodeStatus,
    pub transition: CodeTransition,
}

/// Activation code entity. The secret is held only as `code_hash`.
#[derive(Debug, Clone)]
pub struct ActivationCode {
    pub id: Uuid,
    pub whitelist_id: Uuid,
    pub code_hash: CodeHash,
    pub status: CodeStatus,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
    pub failed_attempts: i32,
    pub max_attempts: i32,
    /// Optimistic-concurrency token; every persisted write must match and bump it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActivationCode {
    /// Create a freshly issued, immediately redeemable code.
    pub fn new(
        whitelist_id: Uuid,
        code_hash: CodeHash,
        expires_at: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            whitelist_id,
            code_hash,
            status: CodeStatus::Active,
            expires_at,
            used_at: None,
            revoked_at: None,
            revoke_reason: None,
            failed_attempts: 0,
            max_attempts,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status as observed at `now`: an active code past its expiry reads as expired even
    /// before the sweeper persists the transition.
    pub fn effective_status(&self, now: DateTime<Utc>) -> CodeStatus {
        match self.status {
            CodeStatus::Active if self.expires_at <= now => CodeStatus::Expired,
            status => status,
        }
    }

    /// Pending, or active and unexpired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.effective_status(now),
            CodeStatus::Pending | CodeStatus::Active
        )
    }

    /// Stored as active but already past its expiry.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == CodeStatus::Active && self.expires_at <= now
    }

    pub fn remaining_attempts(&self) -> i32 {
        (self.max_attempts - self.failed_attempts).max(0)
    }

    /// Apply a lifecycle trigger, stamping the timestamps it implies.
    pub fn apply(
        &mut self,
        transition: CodeTransition,
        now: DateTime<Utc>,
    ) -> Result<CodeStatus, InvalidTransition> {
        let next = next_status(self.status, transition).ok_or(InvalidTransition {
            from: self.status,
            transition,
        })?;

        match transition {
            CodeTransition::Consume => self.used_at = Some(now),
            CodeTransition::Revoke => self.revoked_at = Some(now),
            _ => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(next)
    }
}
