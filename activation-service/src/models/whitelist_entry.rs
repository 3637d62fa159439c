use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Email,
    Phone,
    Other,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Email => "email",
            IdentifierType::Phone => "phone",
            IdentifierType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(IdentifierType::Email),
            "phone" => Some(IdentifierType::Phone),
            "other" => Some(IdentifierType::Other),
            _ => None,
        }
    }
}

/// Role profile copied onto the user account created at activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleProfile {
    pub full_name: String,
    pub phone: Option<String>,
    pub assigned_role: String,
    pub assigned_supervisor: Option<Uuid>,
}

/// A pre-authorized identity. Activated at most once; `activated_user_id` is set
/// exactly when `is_activated` is.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
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
    pub created_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWhitelistEntry {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub full_name: String,
    pub phone: Option<String>,
    pub assigned_role: String,
    pub assigned_supervisor: Option<Uuid>,
    pub created_by: Option<String>,
    pub notes: Option<String>,
}

/// Partial update of identity fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct WhitelistChanges {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub assigned_role: Option<String>,
    pub assigned_supervisor: Option<Uuid>,
    pub notes: Option<String>,
}

impl WhitelistEntry {
    pub fn new(new: NewWhitelistEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: new.identifier.trim().to_string(),
            identifier_type: new.identifier_type,
            full_name: new.full_name,
            phone: new.phone,
            assigned_role: new.assigned_role,
            assigned_supervisor: new.assigned_supervisor,
            is_activated: false,
            activated_user_id: None,
            activated_at: None,
            created_by: new.created_by,
            notes: new.notes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn role_profile(&self) -> RoleProfile {
        RoleProfile {
            full_name: self.full_name.clone(),
            phone: self.phone.clone(),
            assigned_role: self.assigned_role.clone(),
            assigned_supervisor: self.assigned_supervisor,
        }
    }

    /// Case-insensitive identifier comparison key.
    pub fn identifier_key(&self) -> String {
        identifier_key(&self.identifier)
    }

    pub fn mark_activated(&mut self, user_id: Uuid, now: DateTime<Utc>) {
        self.is_activated = true;
        self.activated_user_id = Some(user_id);
        self.activated_at = Some(now);
        self.updated_at = now;
    }

    pub fn apply_changes(&mut self, changes: WhitelistChanges, now: DateTime<Utc>) {
        if let Some(full_name) = changes.full_name {
            self.full_name = full_name;
        }
        if let Some(phone) = changes.phone {
            self.phone = Some(phone);
        }
        if let Some(role) = changes.assigned_role {
            self.assigned_role = role;
        }
        if let Some(supervisor) = changes.assigned_supervisor {
            self.assigned_supervisor = Some(supervisor);
        }
        if let Some(notes) = changes.notes {
            self.notes = Some(notes);
        }
        self.updated_at = now;
    }
}

pub const MAX_IDENTIFIER_LEN: usize = 320;

pub fn identifier_key(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}
