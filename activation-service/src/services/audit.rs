//! Activation audit trail.
//!
//! Recording is best-effort: a failed append is logged and counted but never fails the
//! operation that produced the event.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::models::{AuditEvent, AuditLogEntry};
use crate::services::error::ActivationResult;
use crate::services::metrics;
use crate::services::store::{AuditFilter, AuditStore, AuditSummary};

#[derive(Debug, Clone)]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    pub total: u64,
    pub summary: AuditSummary,
}

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    /// Last issued timestamp in microseconds; entries from one recorder never go backwards.
    last_micros: Arc<AtomicI64>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            last_micros: Arc::new(AtomicI64::new(0)),
        }
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let previous = self
            .last_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let issued = now.max(previous + 1);
        Utc.timestamp_opt(
            issued.div_euclid(1_000_000),
            (issued.rem_euclid(1_000_000) * 1_000) as u32,
        )
        .single()
        .unwrap_or_else(Utc::now)
    }

    /// Append an event. Returns the stored entry, or `None` if the write failed.
    pub async fn record(&self, event: AuditEvent) -> Option<AuditLogEntry> {
        let entry = event.into_entry(self.next_timestamp());

        match self.store.append(&entry).await {
            Ok(()) => {
                tracing::debug!(
                    event_type = %entry.event_type,
                    audit_id = %entry.id,
                    success = entry.success,
                    "Audit event recorded"
                );
                Some(entry)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event_type = %entry.event_type,
                    activation_code_id = ?entry.activation_code_id,
                    "Failed to write activation audit log"
                );
                metrics::record_audit_write_failure(entry.event_type);
                None
            }
        }
    }

    pub async fn query(&self, filter: &AuditFilter) -> ActivationResult<AuditPage> {
        let (entries, total) = self.store.query(filter).await?;
        let summary = self.store.summarize(filter).await?;
        Ok(AuditPage {
            entries,
            total,
            summary,
        })
    }
}
