mod common;

use std::sync::Arc;

use activation_service::models::{
    ActivationCode, AuditEventType, AuditLogEntry, FailureReason, WhitelistEntry,
};
use activation_service::services::{
    ActivationError, ActivationResult, AuditFilter, AuditStore, AuditSummary, CodeFilter,
    CodeRollup, CodeStore, CodeSummary, EntryRollup, MemoryStore, Page, SecurityRollup,
    ValidationOutcome, WhitelistFilter, WhitelistStore,
};
use activation_service::{build_state, AppState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{admin_context, new_entry, test_config, RecordingMailer, TestApp, WRONG_CODE};
use secrecy::ExposeSecret;
use uuid::Uuid;

/// Memory store whose audit appends always fail.
struct FailingAuditStore {
    inner: MemoryStore,
}

#[async_trait]
impl WhitelistStore for FailingAuditStore {
    async fn insert_entry(&self, entry: &WhitelistEntry) -> ActivationResult<()> {
        self.inner.insert_entry(entry).await
    }
    async fn find_entry(&self, id: Uuid) -> ActivationResult<Option<WhitelistEntry>> {
        self.inner.find_entry(id).await
    }
    async fn find_entries(&self, ids: &[Uuid]) -> ActivationResult<Vec<WhitelistEntry>> {
        self.inner.find_entries(ids).await
    }
    async fn find_entry_by_identifier(
        &self,
        identifier: &str,
    ) -> ActivationResult<Option<WhitelistEntry>> {
        self.inner.find_entry_by_identifier(identifier).await
    }
    async fn update_entry(&self, entry: &WhitelistEntry) -> ActivationResult<bool> {
        self.inner.update_entry(entry).await
    }
    async fn delete_entry(&self, id: Uuid) -> ActivationResult<bool> {
        self.inner.delete_entry(id).await
    }
    async fn list_entries(
        &self,
        filter: &WhitelistFilter,
    ) -> ActivationResult<(Vec<WhitelistEntry>, u64)> {
        self.inner.list_entries(filter).await
    }
    async fn entry_rollup(&self, trend_from: DateTime<Utc>) -> ActivationResult<EntryRollup> {
        self.inner.entry_rollup(trend_from).await
    }
}

#[async_trait]
impl CodeStore for FailingAuditStore {
    async fn insert_code(&self, code: &ActivationCode) -> ActivationResult<()> {
        self.inner.insert_code(code).await
    }
    async fn find_code(&self, id: Uuid) -> ActivationResult<Option<ActivationCode>> {
        self.inner.find_code(id).await
    }
    async fn codes_for_entry(&self, whitelist_id: Uuid) -> ActivationResult<Vec<ActivationCode>> {
        self.inner.codes_for_entry(whitelist_id).await
    }
    async fn codes_for_entries(
        &self,
        whitelist_ids: &[Uuid],
    ) -> ActivationResult<Vec<ActivationCode>> {
        self.inner.codes_for_entries(whitelist_ids).await
    }
    async fn update_code(&self, code: &ActivationCode) -> ActivationResult<bool> {
        self.inner.update_code(code).await
    }
    async fn consume_code(
        &self,
        code: &ActivationCode,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ActivationResult<bool> {
        self.inner.consume_code(code, user_id, now).await
    }
    async fn list_codes(
        &self,
        filter: &CodeFilter,
        now: DateTime<Utc>,
    ) -> ActivationResult<(Vec<ActivationCode>, u64)> {
        self.inner.list_codes(filter, now).await
    }
    async fn code_summary(&self, now: DateTime<Utc>) -> ActivationResult<CodeSummary> {
        self.inner.code_summary(now).await
    }
    async fn overdue_codes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ActivationResult<Vec<ActivationCode>> {
        self.inner.overdue_codes(now, limit).await
    }
    async fn code_rollup(&self, now: DateTime<Utc>) -> ActivationResult<CodeRollup> {
        self.inner.code_rollup(now).await
    }
    async fn ping(&self) -> ActivationResult<()> {
        self.inner.ping().await
    }
}

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn append(&self, _entry: &AuditLogEntry) -> ActivationResult<()> {
        Err(ActivationError::Infra(anyhow::anyhow!("audit table unavailable")))
    }
    async fn query(&self, filter: &AuditFilter) -> ActivationResult<(Vec<AuditLogEntry>, u64)> {
        self.inner.query(filter).await
    }
    async fn summarize(&self, filter: &AuditFilter) -> ActivationResult<AuditSummary> {
        self.inner.summarize(filter).await
    }
    async fn security_rollup(&self, since: DateTime<Utc>) -> ActivationResult<SecurityRollup> {
        self.inner.security_rollup(since).await
    }
}

fn attempts_filter(whitelist_id: Uuid) -> AuditFilter {
    AuditFilter {
        whitelist_id: Some(whitelist_id),
        page: Page::new(Some(1), Some(100)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_each_validation_appends_one_attempt_entry() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;

    app.validate(WRONG_CODE, "dana@example.com").await;
    app.validate(WRONG_CODE, "dana@example.com").await;
    app.validate(generated.code.expose_secret(), "dana@example.com")
        .await;

    let (entries, _) = app.repo().query(&attempts_filter(entry.id)).await.unwrap();
    let attempts: Vec<&AuditLogEntry> = entries
        .iter()
        .filter(|e| e.event_type.is_attempt())
        .collect();
    assert_eq!(attempts.len(), 3);

    // Newest first.
    assert_eq!(attempts[0].event_type, AuditEventType::ActivationSuccess);
    assert!(attempts[0].created_user_id.is_some());
    for failed in &attempts[1..] {
        assert_eq!(failed.event_type, AuditEventType::ActivationFailed);
        assert_eq!(failed.failure_reason, Some(FailureReason::InvalidCode));
        assert_eq!(failed.ip_address.as_deref(), Some("198.51.100.10"));
        assert_eq!(failed.identifier_attempted.as_deref(), Some("dana@example.com"));
    }

    // Timestamps follow append order.
    let mut chronological = entries.clone();
    chronological.reverse();
    assert!(chronological
        .windows(2)
        .all(|pair| pair[0].created_at < pair[1].created_at));
}

#[tokio::test]
async fn test_audit_never_stores_plaintext() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;
    app.validate(generated.code.expose_secret(), "dana@example.com")
        .await;

    let plaintext = generated.code.expose_secret().replace('-', "");
    let (entries, _) = app.repo().query(&attempts_filter(entry.id)).await.unwrap();
    for audit in entries {
        let serialized = serde_json::to_string(&audit).unwrap();
        assert!(!serialized.contains(generated.code.expose_secret().as_str()));
        assert!(!serialized.contains(&plaintext));
    }
}

#[tokio::test]
async fn test_query_filters_and_summary() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;
    app.validate_from(WRONG_CODE, "dana@example.com", "203.0.113.1")
        .await;
    app.validate_from(WRONG_CODE, "dana@example.com", "203.0.113.2")
        .await;

    let page = app
        .state
        .audit
        .query(&AuditFilter {
            activation_code_id: Some(generated.code_id),
            success: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.summary.failed, 2);
    assert_eq!(page.summary.successful, 0);
    assert_eq!(page.summary.unique_ips, 2);

    let by_ip = app
        .state
        .audit
        .query(&AuditFilter {
            ip_address: Some("203.0.113.2".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_ip.total, 1);

    let future = app
        .state
        .audit
        .query(&AuditFilter {
            from: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(future.total, 0);
}

#[tokio::test]
async fn test_audit_write_failure_does_not_fail_operations() {
    let store = Arc::new(FailingAuditStore {
        inner: MemoryStore::new(),
    });
    let state: AppState = build_state(
        test_config(),
        store.clone(),
        Arc::new(RecordingMailer::default()),
    )
    .unwrap();

    let entry = state
        .whitelist
        .create(new_entry("dana@example.com"))
        .await
        .unwrap()
        .entry;
    let generated = state
        .engine
        .generate(
            activation_service::services::GenerateRequest {
                whitelist_id: entry.id,
                ttl_hours: Some(24),
                send_email: true,
                custom_message: None,
            },
            &admin_context(),
        )
        .await
        .unwrap();
    assert_eq!(generated.email_sent, Some(true));

    let outcome = state
        .engine
        .validate(activation_service::services::ValidateRequest {
            code: generated.code.clone(),
            identifier: "dana@example.com".to_string(),
            context: admin_context(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ValidationOutcome::Success(_)));

    let (entries, total) = store.query(&AuditFilter::default()).await.unwrap();
    assert!(entries.is_empty());
    assert_eq!(total, 0);
}
