use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::dtos::PageMeta;
use crate::models::{IdentifierType, NewWhitelistEntry, WhitelistChanges};
use crate::services::{Page, WhitelistFilter, WhitelistListing, WhitelistView};

fn default_identifier_type() -> IdentifierType {
    IdentifierType::Email
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateWhitelistRequest {
    #[validate(length(min = 1, max = 320, message = "Identifier must be 1-320 characters"))]
    pub identifier: String,
    #[serde(default = "default_identifier_type")]
    pub identifier_type: IdentifierType,
    #[validate(length(min = 1, max = 200, message = "Full name must be 1-200 characters"))]
    pub full_name: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(min = 1, max = 100, message = "Assigned role must be 1-100 characters"))]
    pub assigned_role: String,
    pub assigned_supervisor: Option<Uuid>,
    pub notes: Option<String>,
}

impl CreateWhitelistRequest {
    pub fn into_new_entry(self, created_by: Option<String>) -> NewWhitelistEntry {
        NewWhitelistEntry {
            identifier: self.identifier,
            identifier_type: self.identifier_type,
            full_name: self.full_name,
            phone: self.phone,
            assigned_role: self.assigned_role,
            assigned_supervisor: self.assigned_supervisor,
            created_by,
            notes: self.notes,
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateWhitelistRequest {
    #[validate(length(min = 1, max = 200))]
    pub full_name: Option<String>,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub assigned_role: Option<String>,
    pub assigned_supervisor: Option<Uuid>,
    pub notes: Option<String>,
}

impl From<UpdateWhitelistRequest> for WhitelistChanges {
    fn from(req: UpdateWhitelistRequest) -> Self {
        WhitelistChanges {
            full_name: req.full_name,
            phone: req.phone,
            assigned_role: req.assigned_role,
            assigned_supervisor: req.assigned_supervisor,
            notes: req.notes,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WhitelistQuery {
    pub is_activated: Option<bool>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl WhitelistQuery {
    pub fn into_filter(self) -> WhitelistFilter {
        WhitelistFilter {
            is_activated: self.is_activated,
            search: self.search.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            page: Page::new(self.page, self.page_size),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WhitelistResponse {
    pub id: Uuid,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub full_name: String,
    pub phone: Option<String>,
    pub assigned_role: String,
    pub assigned_supervisor: Option<Uuid>,
    pub is_activated: bool,
    pub activated_user_id: Option<Uuid>,
    pub activated_at: Option<DateTime<Utc>>,
    pub has_active_code: bool,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WhitelistView> for WhitelistResponse {
    fn from(view: WhitelistView) -> Self {
        let entry = view.entry;
        Self {
            id: entry.id,
            identifier: entry.identifier,
            identifier_type: entry.identifier_type,
            full_name: entry.full_name,
            phone: entry.phone,
            assigned_role: entry.assigned_role,
            assigned_supervisor: entry.assigned_supervisor,
            is_activated: entry.is_activated,
            activated_user_id: entry.activated_user_id,
            activated_at: entry.activated_at,
            has_active_code: view.has_active_code,
            code_expires_at: view.code_expires_at,
            created_by: entry.created_by,
            notes: entry.notes,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WhitelistListResponse {
    pub entries: Vec<WhitelistResponse>,
    #[serde(flatten)]
    pub pagination: PageMeta,
}

impl From<WhitelistListing> for WhitelistListResponse {
    fn from(listing: WhitelistListing) -> Self {
        Self {
            pagination: PageMeta::new(listing.page, listing.total),
            entries: listing.entries.into_iter().map(Into::into).collect(),
        }
    }
}
