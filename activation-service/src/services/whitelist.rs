//! Whitelist administration. Entries are editable and deletable only until activated.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::ValidateEmail;

use crate::models::{IdentifierType, NewWhitelistEntry, WhitelistChanges, WhitelistEntry};
use crate::services::error::{ActivationError, ActivationResult};
use crate::services::store::{ActivationRepository, Page, WhitelistFilter};

/// An entry together with the state of its current code, if any.
#[derive(Debug, Clone)]
pub struct WhitelistView {
    pub entry: WhitelistEntry,
    pub has_active_code: bool,
    pub code_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct WhitelistListing {
    pub entries: Vec<WhitelistView>,
    pub total: u64,
    pub page: Page,
}

#[derive(Clone)]
pub struct WhitelistService {
    repo: Arc<dyn ActivationRepository>,
}

impl WhitelistService {
    pub fn new(repo: Arc<dyn ActivationRepository>) -> Self {
        Self { repo }
    }

    #[tracing::instrument(skip(self, new), fields(identifier_type = new.identifier_type.as_str()))]
    pub async fn create(&self, new: NewWhitelistEntry) -> ActivationResult<WhitelistView> {
        if new.identifier.trim().is_empty() {
            return Err(ActivationError::Validation("identifier is required".to_string()));
        }
        if new.identifier_type == IdentifierType::Email && !new.identifier.trim().validate_email() {
            return Err(ActivationError::Validation(
                "identifier is not a valid email address".to_string(),
            ));
        }
        if new.full_name.trim().is_empty() {
            return Err(ActivationError::Validation("full_name is required".to_string()));
        }

        let entry = WhitelistEntry::new(new, Utc::now());
        self.repo.insert_entry(&entry).await?;
        tracing::info!(whitelist_id = %entry.id, "Whitelist entry created");

        Ok(WhitelistView {
            entry,
            has_active_code: false,
            code_expires_at: None,
        })
    }

    pub async fn get(&self, id: Uuid) -> ActivationResult<WhitelistView> {
        let entry = self
            .repo
            .find_entry(id)
            .await?
            .ok_or_else(|| ActivationError::not_found("Whitelist entry"))?;
        self.view(entry).await
    }

    pub async fn list(&self, filter: &WhitelistFilter) -> ActivationResult<WhitelistListing> {
        let (entries, total) = self.repo.list_entries(filter).await?;

        let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        let now = Utc::now();
        let mut live_expiry: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for code in self.repo.codes_for_entries(&ids).await? {
            if code.is_live(now) {
                live_expiry.insert(code.whitelist_id, code.expires_at);
            }
        }

        let entries = entries
            .into_iter()
            .map(|entry| {
                let code_expires_at = live_expiry.get(&entry.id).copied();
                WhitelistView {
                    entry,
                    has_active_code: code_expires_at.is_some(),
                    code_expires_at,
                }
            })
            .collect();

        Ok(WhitelistListing {
            entries,
            total,
            page: filter.page,
        })
    }

    #[tracing::instrument(skip(self, changes))]
    pub async fn update(&self, id: Uuid, changes: WhitelistChanges) -> ActivationResult<WhitelistView> {
        let mut entry = self
            .repo
            .find_entry(id)
            .await?
            .ok_or_else(|| ActivationError::not_found("Whitelist entry"))?;
        if entry.is_activated {
            return Err(ActivationError::InvalidState(
                "Activated whitelist entries cannot be modified".to_string(),
            ));
        }

        entry.apply_changes(changes, Utc::now());
        if !self.repo.update_entry(&entry).await? {
            // Activated (or removed) between the read and the write.
            return Err(ActivationError::InvalidState(
                "Whitelist entry changed state during update".to_string(),
            ));
        }

        self.view(entry).await
    }

    /// Entries with any code history are kept so the audit trail stays resolvable.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> ActivationResult<()> {
        let entry = self
            .repo
            .find_entry(id)
            .await?
            .ok_or_else(|| ActivationError::not_found("Whitelist entry"))?;
        if entry.is_activated {
            return Err(ActivationError::InvalidState(
                "Activated whitelist entries cannot be deleted".to_string(),
            ));
        }

        if !self.repo.delete_entry(id).await? {
            return Err(ActivationError::InvalidState(
                "Whitelist entry changed state during delete".to_string(),
            ));
        }
        tracing::info!(whitelist_id = %id, "Whitelist entry deleted");
        Ok(())
    }

    async fn view(&self, entry: WhitelistEntry) -> ActivationResult<WhitelistView> {
        let now = Utc::now();
        let code_expires_at = self
            .repo
            .codes_for_entry(entry.id)
            .await?
            .into_iter()
            .find(|c| c.is_live(now))
            .map(|c| c.expires_at);

        Ok(WhitelistView {
            entry,
            has_active_code: code_expires_at.is_some(),
            code_expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivationCode, CodeTransition};
    use crate::services::hasher::CodeHash;
    use crate::services::memory::MemoryStore;
    use crate::services::store::CodeStore;

    fn new_entry(identifier: &str) -> NewWhitelistEntry {
        NewWhitelistEntry {
            identifier: identifier.to_string(),
            identifier_type: IdentifierType::Email,
            full_name: "Dana Field".to_string(),
            phone: None,
            assigned_role: "field_agent".to_string(),
            assigned_supervisor: None,
            created_by: Some("ops".to_string()),
            notes: None,
        }
    }

    fn service() -> (WhitelistService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (WhitelistService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_duplicate_identifier_conflicts_case_insensitively() {
        let (service, _) = service();
        service.create(new_entry("dana@example.com")).await.unwrap();

        let err = service.create(new_entry("DANA@example.com")).await.unwrap_err();
        assert!(matches!(err, ActivationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_email_identifier_must_be_valid() {
        let (service, _) = service();
        let err = service.create(new_entry("not-an-email")).await.unwrap_err();
        assert!(matches!(err, ActivationError::Validation(_)));

        let mut phone = new_entry("+15550100");
        phone.identifier_type = IdentifierType::Phone;
        assert!(service.create(phone).await.is_ok());
    }

    #[tokio::test]
    async fn test_activated_entry_is_frozen() {
        let (service, store) = service();
        let view = service.create(new_entry("dana@example.com")).await.unwrap();

        let now = Utc::now();
        let mut code = ActivationCode::new(
            view.entry.id,
            CodeHash::new("$argon2id$test".to_string()),
            now + chrono::Duration::hours(1),
            5,
            now,
        );
        store.insert_code(&code).await.unwrap();
        code.apply(CodeTransition::Consume, now).unwrap();
        assert!(store.consume_code(&code, Uuid::new_v4(), now).await.unwrap());

        let err = service
            .update(view.entry.id, WhitelistChanges::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::InvalidState(_)));

        let err = service.delete(view.entry.id).await.unwrap_err();
        assert!(matches!(err, ActivationError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_update_and_delete_pending_entry() {
        let (service, _) = service();
        let view = service.create(new_entry("dana@example.com")).await.unwrap();

        let updated = service
            .update(
                view.entry.id,
                WhitelistChanges {
                    assigned_role: Some("supervisor".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.entry.assigned_role, "supervisor");
        assert!(!updated.has_active_code);

        service.delete(view.entry.id).await.unwrap();
        assert!(matches!(
            service.get(view.entry.id).await,
            Err(ActivationError::NotFound(_))
        ));
    }
}
