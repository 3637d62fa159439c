use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dtos::PageMeta;
use crate::models::{AuditEventType, AuditLogEntry, FailureReason};
use crate::services::{AuditFilter, AuditPage, AuditSummary, Page};

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub activation_code_id: Option<Uuid>,
    pub whitelist_id: Option<Uuid>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
    pub success: Option<bool>,
    pub ip_address: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl AuditQuery {
    pub fn into_filter(self) -> AuditFilter {
        AuditFilter {
            activation_code_id: self.activation_code_id,
            whitelist_id: self.whitelist_id,
            from: self.date_from,
            to: self.date_to,
            event_type: self.event_type,
            success: self.success,
            ip_address: self.ip_address.filter(|ip| !ip.is_empty()),
            page: Page::new(self.page, self.page_size),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditLogResponse {
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
    pub request_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<AuditLogEntry> for AuditLogResponse {
    fn from(entry: AuditLogEntry) -> Self {
        Self {
            id: entry.id,
            event_type: entry.event_type,
            activation_code_id: entry.activation_code_id,
            whitelist_id: entry.whitelist_id,
            identifier_attempted: entry.identifier_attempted,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            device_id: entry.device_id,
            success: entry.success,
            failure_reason: entry.failure_reason,
            created_user_id: entry.created_user_id,
            request_metadata: entry.request_metadata,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditListResponse {
    pub logs: Vec<AuditLogResponse>,
    #[serde(flatten)]
    pub pagination: PageMeta,
    pub summary: AuditSummary,
}

impl AuditListResponse {
    pub fn from_page(audit: AuditPage, page: Page) -> Self {
        Self {
            pagination: PageMeta::new(page, audit.total),
            logs: audit.entries.into_iter().map(Into::into).collect(),
            summary: audit.summary,
        }
    }
}
