//! Storage seams. Every code write is conditional on the version the caller read;
//! a `false` return means another writer got there first and the caller must reload.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{
    ActivationCode, AuditEventType, AuditLogEntry, CodeStatus, FailureReason, WhitelistEntry,
};
use crate::services::error::ActivationResult;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Window used by the "expiring soon" filter and summary counter.
pub fn expiring_soon_window() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    /// Clamp caller input into a valid page (1-based, bounded size).
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        ((self.page - 1) as usize) * self.page_size as usize
    }

    pub fn limit(&self) -> usize {
        self.page_size as usize
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(self.page_size as u64)
    }

    /// Slice an already ordered in-memory result set.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset())
            .take(self.limit())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WhitelistFilter {
    pub is_activated: Option<bool>,
    /// Case-insensitive substring of identifier or full name.
    pub search: Option<String>,
    pub page: Page,
}

impl WhitelistFilter {
    pub fn matches(&self, entry: &WhitelistEntry) -> bool {
        if let Some(activated) = self.is_activated {
            if entry.is_activated != activated {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            if !entry.identifier.to_lowercase().contains(&search)
                && !entry.full_name.to_lowercase().contains(&search)
            {
                return false;
            }
        }
        true
    }
}

/// Code listing filter. Status filtering uses the effective status, so an overdue
/// active code is listed as expired.
#[derive(Debug, Clone, Default)]
pub struct CodeFilter {
    pub status: Option<CodeStatus>,
    pub whitelist_id: Option<Uuid>,
    pub expiring_soon: bool,
    pub page: Page,
}

impl CodeFilter {
    pub fn matches(&self, code: &ActivationCode, now: DateTime<Utc>) -> bool {
        if let Some(status) = self.status {
            if code.effective_status(now) != status {
                return false;
            }
        }
        if let Some(whitelist_id) = self.whitelist_id {
            if code.whitelist_id != whitelist_id {
                return false;
            }
        }
        if self.expiring_soon && !is_expiring_soon(code, now) {
            return false;
        }
        true
    }
}

pub fn is_expiring_soon(code: &ActivationCode, now: DateTime<Utc>) -> bool {
    code.is_live(now) && code.expires_at <= now + expiring_soon_window()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeSummary {
    pub pending: u64,
    pub active: u64,
    pub expired: u64,
    pub used: u64,
    pub locked: u64,
    pub revoked: u64,
    pub expiring_in_24h: u64,
}

impl CodeSummary {
    pub fn from_codes<'a>(
        codes: impl IntoIterator<Item = &'a ActivationCode>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut summary = CodeSummary::default();
        for code in codes {
            summary.add(code.effective_status(now), 1);
            if is_expiring_soon(code, now) {
                summary.expiring_in_24h += 1;
            }
        }
        summary
    }

    pub fn add(&mut self, status: CodeStatus, count: u64) {
        match status {
            CodeStatus::Pending => self.pending += count,
            CodeStatus::Active => self.active += count,
            CodeStatus::Expired => self.expired += count,
            CodeStatus::Used => self.used += count,
            CodeStatus::Locked => self.locked += count,
            CodeStatus::Revoked => self.revoked += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.active + self.expired + self.used + self.locked + self.revoked
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub activation_code_id: Option<Uuid>,
    pub whitelist_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
    pub success: Option<bool>,
    pub ip_address: Option<String>,
    pub page: Page,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.activation_code_id
            .map_or(true, |id| entry.activation_code_id == Some(id))
            && self
                .whitelist_id
                .map_or(true, |id| entry.whitelist_id == Some(id))
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
            && self.event_type.map_or(true, |t| entry.event_type == t)
            && self.success.map_or(true, |s| entry.success == s)
            && self
                .ip_address
                .as_deref()
                .map_or(true, |ip| entry.ip_address.as_deref() == Some(ip))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub unique_ips: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl AuditSummary {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditLogEntry>) -> Self {
        let mut summary = AuditSummary::default();
        let mut ips = std::collections::HashSet::new();
        for entry in entries {
            summary.total += 1;
            if entry.success {
                summary.successful += 1;
            } else {
                summary.failed += 1;
            }
            if let Some(ip) = entry.ip_address.as_deref() {
                ips.insert(ip.to_string());
            }
            summary.earliest = Some(summary.earliest.map_or(entry.created_at, |e| e.min(entry.created_at)));
            summary.latest = Some(summary.latest.map_or(entry.created_at, |l| l.max(entry.created_at)));
        }
        summary.unique_ips = ips.len() as u64;
        summary
    }
}

/// Time from whitelisting to activation over activated entries, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationTimes {
    pub mean_seconds: f64,
    pub median_seconds: f64,
    pub min_seconds: f64,
    pub max_seconds: f64,
}

impl ActivationTimes {
    /// `seconds` must be sorted ascending.
    fn from_sorted(seconds: &[i64]) -> Option<Self> {
        let (first, last) = (*seconds.first()?, *seconds.last()?);
        let n = seconds.len();
        let median = if n % 2 == 0 {
            (seconds[n / 2 - 1] + seconds[n / 2]) as f64 / 2.0
        } else {
            seconds[n / 2] as f64
        };
        Some(Self {
            mean_seconds: seconds.iter().sum::<i64>() as f64 / n as f64,
            median_seconds: median,
            min_seconds: first as f64,
            max_seconds: last as f64,
        })
    }
}

/// Whitelist counts feeding the stats rollup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryRollup {
    pub total: u64,
    pub activated: u64,
    pub activation_times: Option<ActivationTimes>,
    /// Activations per UTC day since the trend start, oldest first. Empty days are absent.
    pub activations_by_day: Vec<(NaiveDate, u64)>,
}

impl EntryRollup {
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = &'a WhitelistEntry>,
        trend_from: DateTime<Utc>,
    ) -> Self {
        let mut rollup = EntryRollup::default();
        let mut seconds = Vec::new();
        let mut by_day: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        for entry in entries {
            rollup.total += 1;
            if entry.is_activated {
                rollup.activated += 1;
            }
            if let Some(at) = entry.activated_at {
                seconds.push((at - entry.created_at).num_seconds().max(0));
                if at >= trend_from {
                    *by_day.entry(at.date_naive()).or_insert(0) += 1;
                }
            }
        }
        seconds.sort_unstable();
        rollup.activation_times = ActivationTimes::from_sorted(&seconds);
        rollup.activations_by_day = by_day.into_iter().collect();
        rollup
    }
}

/// Code counts feeding the stats rollup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeRollup {
    pub summary: CodeSummary,
    /// Failed attempts plus one per redeemed code.
    pub attempts: u64,
}

impl CodeRollup {
    pub fn from_codes<'a>(
        codes: impl IntoIterator<Item = &'a ActivationCode>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut rollup = CodeRollup::default();
        for code in codes {
            rollup.summary.add(code.effective_status(now), 1);
            if is_expiring_soon(code, now) {
                rollup.summary.expiring_in_24h += 1;
            }
            rollup.attempts +=
                code.failed_attempts.max(0) as u64 + u64::from(code.status == CodeStatus::Used);
        }
        rollup
    }
}

/// Audit counts over a recent window feeding the stats rollup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityRollup {
    pub failed_attempts: u64,
    pub rate_limit_violations: u64,
    /// Distinct IPs among the rate limit violations.
    pub blocked_ips: u64,
}

impl SecurityRollup {
    pub fn from_events<'a>(
        events: impl IntoIterator<Item = &'a AuditLogEntry>,
        since: DateTime<Utc>,
    ) -> Self {
        let mut rollup = SecurityRollup::default();
        let mut ips = HashSet::new();
        for event in events.into_iter().filter(|e| e.created_at >= since) {
            if event.event_type == AuditEventType::ActivationFailed {
                rollup.failed_attempts += 1;
            }
            if is_rate_limit_violation(event) {
                rollup.rate_limit_violations += 1;
                if let Some(ip) = event.ip_address.as_deref() {
                    ips.insert(ip);
                }
            }
        }
        rollup.blocked_ips = ips.len() as u64;
        rollup
    }
}

fn is_rate_limit_violation(event: &AuditLogEntry) -> bool {
    event.event_type == AuditEventType::RateLimitExceeded
        || event.failure_reason == Some(FailureReason::RateLimited)
}

#[async_trait]
pub trait WhitelistStore: Send + Sync {
    /// Fails with `Conflict` when the identifier is already registered (case-insensitive).
    async fn insert_entry(&self, entry: &WhitelistEntry) -> ActivationResult<()>;
    async fn find_entry(&self, id: Uuid) -> ActivationResult<Option<WhitelistEntry>>;
    async fn find_entries(&self, ids: &[Uuid]) -> ActivationResult<Vec<WhitelistEntry>>;
    async fn find_entry_by_identifier(&self, identifier: &str) -> ActivationResult<Option<WhitelistEntry>>;
    /// Writes identity fields. Returns `false` if the entry is missing or activated.
    async fn update_entry(&self, entry: &WhitelistEntry) -> ActivationResult<bool>;
    /// Returns `false` if the entry is missing or activated; `Conflict` if it has codes.
    async fn delete_entry(&self, id: Uuid) -> ActivationResult<bool>;
    async fn list_entries(&self, filter: &WhitelistFilter) -> ActivationResult<(Vec<WhitelistEntry>, u64)>;
    async fn entry_rollup(&self, trend_from: DateTime<Utc>) -> ActivationResult<EntryRollup>;
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Fails with `Conflict` when the entry already has a pending or active code.
    async fn insert_code(&self, code: &ActivationCode) -> ActivationResult<()>;
    async fn find_code(&self, id: Uuid) -> ActivationResult<Option<ActivationCode>>;
    /// All codes of an entry, newest first.
    async fn codes_for_entry(&self, whitelist_id: Uuid) -> ActivationResult<Vec<ActivationCode>>;
    async fn codes_for_entries(&self, whitelist_ids: &[Uuid]) -> ActivationResult<Vec<ActivationCode>>;
    /// Persist `code` if the stored version still equals `code.version`; the stored
    /// version becomes `code.version + 1`.
    async fn update_code(&self, code: &ActivationCode) -> ActivationResult<bool>;
    /// Persist a consumed code and activate its entry in one atomic step. Succeeds only
    /// if the code version matches and the entry is not yet activated.
    async fn consume_code(
        &self,
        code: &ActivationCode,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ActivationResult<bool>;
    async fn list_codes(
        &self,
        filter: &CodeFilter,
        now: DateTime<Utc>,
    ) -> ActivationResult<(Vec<ActivationCode>, u64)>;
    async fn code_summary(&self, now: DateTime<Utc>) -> ActivationResult<CodeSummary>;
    /// Codes stored as active whose expiry has passed, oldest expiry first.
    async fn overdue_codes(&self, now: DateTime<Utc>, limit: usize) -> ActivationResult<Vec<ActivationCode>>;
    async fn code_rollup(&self, now: DateTime<Utc>) -> ActivationResult<CodeRollup>;
    async fn ping(&self) -> ActivationResult<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> ActivationResult<()>;
    /// Newest first.
    async fn query(&self, filter: &AuditFilter) -> ActivationResult<(Vec<AuditLogEntry>, u64)>;
    async fn summarize(&self, filter: &AuditFilter) -> ActivationResult<AuditSummary>;
    async fn security_rollup(&self, since: DateTime<Utc>) -> ActivationResult<SecurityRollup>;
}

pub trait ActivationRepository: WhitelistStore + CodeStore + AuditStore {}

impl<T: WhitelistStore + CodeStore + AuditStore> ActivationRepository for T {}
