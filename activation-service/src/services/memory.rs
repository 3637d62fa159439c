//! In-process backend. All tables sit behind one mutex so multi-record writes (code
//! consumption plus entry activation) are atomic, matching the Postgres transaction.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{ActivationCode, AuditLogEntry, CodeStatus, WhitelistEntry};
use crate::services::error::{ActivationError, ActivationResult};
use crate::services::store::{
    AuditFilter, AuditStore, AuditSummary, CodeFilter, CodeRollup, CodeStore, CodeSummary,
    EntryRollup, SecurityRollup, WhitelistFilter, WhitelistStore,
};

#[derive(Default)]
struct Tables {
    entries: HashMap<Uuid, WhitelistEntry>,
    codes: HashMap<Uuid, ActivationCode>,
    audit: Vec<AuditLogEntry>,
}

impl Tables {
    fn has_other_live_code(&self, whitelist_id: Uuid, except: Option<Uuid>) -> bool {
        self.codes.values().any(|c| {
            c.whitelist_id == whitelist_id
                && Some(c.id) != except
                && matches!(c.status, CodeStatus::Pending | CodeStatus::Active)
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> ActivationResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store mutex poisoned: {}", e).into())
    }
}

fn newest_first(codes: &mut [ActivationCode]) {
    codes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl WhitelistStore for MemoryStore {
    async fn insert_entry(&self, entry: &WhitelistEntry) -> ActivationResult<()> {
        let mut tables = self.tables()?;
        let key = entry.identifier_key();
        if tables.entries.values().any(|e| e.identifier_key() == key) {
            return Err(ActivationError::Conflict(
                "Identifier is already whitelisted".to_string(),
            ));
        }
        tables.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn find_entry(&self, id: Uuid) -> ActivationResult<Option<WhitelistEntry>> {
        Ok(self.tables()?.entries.get(&id).cloned())
    }

    async fn find_entries(&self, ids: &[Uuid]) -> ActivationResult<Vec<WhitelistEntry>> {
        let tables = self.tables()?;
        Ok(ids.iter().filter_map(|id| tables.entries.get(id).cloned()).collect())
    }

    async fn find_entry_by_identifier(
        &self,
        identifier: &str,
    ) -> ActivationResult<Option<WhitelistEntry>> {
        let key = crate::models::whitelist_entry::identifier_key(identifier);
        Ok(self
            .tables()?
            .entries
            .values()
            .find(|e| e.identifier_key() == key)
            .cloned())
    }

    async fn update_entry(&self, entry: &WhitelistEntry) -> ActivationResult<bool> {
        let mut tables = self.tables()?;
        match tables.entries.get_mut(&entry.id) {
            Some(stored) if !stored.is_activated => {
                stored.full_name = entry.full_name.clone();
                stored.phone = entry.phone.clone();
                stored.assigned_role = entry.assigned_role.clone();
                stored.assigned_supervisor = entry.assigned_supervisor;
                stored.notes = entry.notes.clone();
                stored.updated_at = entry.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_entry(&self, id: Uuid) -> ActivationResult<bool> {
        let mut tables = self.tables()?;
        let deletable = tables.entries.get(&id).is_some_and(|e| !e.is_activated);
        if !deletable {
            return Ok(false);
        }
        if tables.codes.values().any(|c| c.whitelist_id == id) {
            return Err(ActivationError::Conflict(
                "Whitelist entry has activation code history and cannot be deleted".to_string(),
            ));
        }
        tables.entries.remove(&id);
        Ok(true)
    }

    async fn list_entries(
        &self,
        filter: &WhitelistFilter,
    ) -> ActivationResult<(Vec<WhitelistEntry>, u64)> {
        let tables = self.tables()?;
        let mut matching: Vec<WhitelistEntry> = tables
            .entries
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        Ok((filter.page.slice(&matching), total))
    }

    async fn entry_rollup(&self, trend_from: DateTime<Utc>) -> ActivationResult<EntryRollup> {
        Ok(EntryRollup::from_entries(self.tables()?.entries.values(), trend_from))
    }
}

#[async_trait]
impl CodeStore for MemoryStore {
    async fn insert_code(&self, code: &ActivationCode) -> ActivationResult<()> {
        let mut tables = self.tables()?;
        if !tables.entries.contains_key(&code.whitelist_id) {
            return Err(ActivationError::not_found("Whitelist entry"));
        }
        if tables.has_other_live_code(code.whitelist_id, None) {
            return Err(ActivationError::Conflict(
                "Whitelist entry already has a live activation code".to_string(),
            ));
        }
        tables.codes.insert(code.id, code.clone());
        Ok(())
    }

    async fn find_code(&self, id: Uuid) -> ActivationResult<Option<ActivationCode>> {
        Ok(self.tables()?.codes.get(&id).cloned())
    }

    async fn codes_for_entry(&self, whitelist_id: Uuid) -> ActivationResult<Vec<ActivationCode>> {
        self.codes_for_entries(&[whitelist_id]).await
    }

    async fn codes_for_entries(
        &self,
        whitelist_ids: &[Uuid],
    ) -> ActivationResult<Vec<ActivationCode>> {
        let mut codes: Vec<ActivationCode> = self
            .tables()?
            .codes
            .values()
            .filter(|c| whitelist_ids.contains(&c.whitelist_id))
            .cloned()
            .collect();
        newest_first(&mut codes);
        Ok(codes)
    }

    async fn update_code(&self, code: &ActivationCode) -> ActivationResult<bool> {
        let mut tables = self.tables()?;
        let version_matches = tables
            .codes
            .get(&code.id)
            .is_some_and(|stored| stored.version == code.version);
        if !version_matches {
            return Ok(false);
        }

        let becomes_live = matches!(code.status, CodeStatus::Pending | CodeStatus::Active);
        if becomes_live && tables.has_other_live_code(code.whitelist_id, Some(code.id)) {
            return Err(ActivationError::Conflict(
                "Whitelist entry already has a live activation code".to_string(),
            ));
        }

        let mut next = code.clone();
        next.version = code.version + 1;
        tables.codes.insert(code.id, next);
        Ok(true)
    }

    async fn consume_code(
        &self,
        code: &ActivationCode,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ActivationResult<bool> {
        let mut tables = self.tables()?;
        let Tables { entries, codes, .. } = &mut *tables;

        let version_matches = codes
            .get(&code.id)
            .is_some_and(|stored| stored.version == code.version);
        let Some(entry) = entries.get_mut(&code.whitelist_id) else {
            return Ok(false);
        };
        if !version_matches || entry.is_activated {
            return Ok(false);
        }

        entry.mark_activated(user_id, now);
        let mut next = code.clone();
        next.version = code.version + 1;
        codes.insert(code.id, next);
        Ok(true)
    }

    async fn list_codes(
        &self,
        filter: &CodeFilter,
        now: DateTime<Utc>,
    ) -> ActivationResult<(Vec<ActivationCode>, u64)> {
        let mut matching: Vec<ActivationCode> = self
            .tables()?
            .codes
            .values()
            .filter(|c| filter.matches(c, now))
            .cloned()
            .collect();
        newest_first(&mut matching);

        let total = matching.len() as u64;
        Ok((filter.page.slice(&matching), total))
    }

    async fn code_summary(&self, now: DateTime<Utc>) -> ActivationResult<CodeSummary> {
        Ok(CodeSummary::from_codes(self.tables()?.codes.values(), now))
    }

    async fn overdue_codes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ActivationResult<Vec<ActivationCode>> {
        let mut overdue: Vec<ActivationCode> = self
            .tables()?
            .codes
            .values()
            .filter(|c| c.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|c| c.expires_at);
        overdue.truncate(limit);
        Ok(overdue)
    }

    async fn code_rollup(&self, now: DateTime<Utc>) -> ActivationResult<CodeRollup> {
        Ok(CodeRollup::from_codes(self.tables()?.codes.values(), now))
    }

    async fn ping(&self) -> ActivationResult<()> {
        self.tables().map(|_| ())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, entry: &AuditLogEntry) -> ActivationResult<()> {
        self.tables()?.audit.push(entry.clone());
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> ActivationResult<(Vec<AuditLogEntry>, u64)> {
        let tables = self.tables()?;
        let mut matching: Vec<AuditLogEntry> = tables
            .audit
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Concurrent recorders may append out of timestamp order.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        Ok((filter.page.slice(&matching), total))
    }

    async fn summarize(&self, filter: &AuditFilter) -> ActivationResult<AuditSummary> {
        let tables = self.tables()?;
        Ok(AuditSummary::from_entries(
            tables.audit.iter().filter(|e| filter.matches(e)),
        ))
    }

    async fn security_rollup(&self, since: DateTime<Utc>) -> ActivationResult<SecurityRollup> {
        Ok(SecurityRollup::from_events(&self.tables()?.audit, since))
    }
}
