//! PostgreSQL backend.
//!
//! Status and enum columns are stored as text and converted at the row boundary.
//! Code writes are `UPDATE ... WHERE version = $n`; a zero row count means a
//! concurrent writer won.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::QueryAs;
use sqlx::{FromRow, Postgres};
use tracing::instrument;
use uuid::Uuid;

use crate::models::{
    ActivationCode, AuditEventType, AuditLogEntry, CodeStatus, FailureReason, IdentifierType,
    WhitelistEntry,
};
use crate::services::error::{ActivationError, ActivationResult};
use crate::services::hasher::CodeHash;
use crate::services::metrics::QueryTimer;
use crate::services::store::{
    ActivationTimes, AuditFilter, AuditStore, AuditSummary, CodeFilter, CodeRollup, CodeStore,
    CodeSummary, EntryRollup, SecurityRollup, WhitelistFilter, WhitelistStore,
};

const WHITELIST_COLUMNS: &str = "id, identifier, identifier_type, full_name, phone, assigned_role, \
    assigned_supervisor, is_activated, activated_user_id, activated_at, created_by, notes, \
    created_at, updated_at";

const CODE_COLUMNS: &str = "id, whitelist_id, code_hash, status, expires_at, used_at, revoked_at, \
    revoke_reason, failed_attempts, max_attempts, version, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, event_type, activation_code_id, whitelist_id, identifier_attempted, \
    ip_address, user_agent, device_id, success, failure_reason, created_user_id, request_metadata, \
    created_at";

/// Lazy-expiry aware status predicate over `$1` (status text) and `$2` (now).
const CODE_FILTER_WHERE: &str = r#"
    ($1::varchar IS NULL
        OR ($1 = 'active' AND status = 'active' AND expires_at > $2)
        OR ($1 = 'expired' AND (status = 'expired' OR (status = 'active' AND expires_at <= $2)))
        OR ($1 NOT IN ('active', 'expired') AND status = $1))
    AND ($3::uuid IS NULL OR whitelist_id = $3)
    AND ($4 = FALSE OR (
        (status = 'pending' OR (status = 'active' AND expires_at > $2))
        AND expires_at <= $2 + INTERVAL '24 hours'))
"#;

const AUDIT_FILTER_WHERE: &str = r#"
    ($1::uuid IS NULL OR activation_code_id = $1)
    AND ($2::uuid IS NULL OR whitelist_id = $2)
    AND ($3::timestamptz IS NULL OR created_at >= $3)
    AND ($4::timestamptz IS NULL OR created_at <= $4)
    AND ($5::varchar IS NULL OR event_type = $5)
    AND ($6::boolean IS NULL OR success = $6)
    AND ($7::varchar IS NULL OR ip_address = $7)
"#;

#[derive(Debug, FromRow)]
struct WhitelistRow {
    id: Uuid,
    identifier: String,
    identifier_type: String,
    full_name: String,
    phone: Option<String>,
    assigned_role: String,
    assigned_supervisor: Option<Uuid>,
    is_activated: bool,
    activated_user_id: Option<Uuid>,
    activated_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WhitelistRow> for WhitelistEntry {
    type Error = anyhow::Error;

    fn try_from(row: WhitelistRow) -> Result<Self, Self::Error> {
        Ok(WhitelistEntry {
            id: row.id,
            identifier: row.identifier,
            identifier_type: IdentifierType::parse(&row.identifier_type)
                .ok_or_else(|| anyhow::anyhow!("Unknown identifier type: {}", row.identifier_type))?,
            full_name: row.full_name,
            phone: row.phone,
            assigned_role: row.assigned_role,
            assigned_supervisor: row.assigned_supervisor,
            is_activated: row.is_activated,
            activated_user_id: row.activated_user_id,
            activated_at: row.activated_at,
            created_by: row.created_by,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CodeRow {
    id: Uuid,
    whitelist_id: Uuid,
    code_hash: String,
    status: String,
    expires_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    revoke_reason: Option<String>,
    failed_attempts: i32,
    max_attempts: i32,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CodeRow> for ActivationCode {
    type Error = anyhow::Error;

    fn try_from(row: CodeRow) -> Result<Self, Self::Error> {
        Ok(ActivationCode {
            id: row.id,
            whitelist_id: row.whitelist_id,
            code_hash: CodeHash::new(row.code_hash),
            status: CodeStatus::parse(&row.status)
                .ok_or_else(|| anyhow::anyhow!("Unknown code status: {}", row.status))?,
            expires_at: row.expires_at,
            used_at: row.used_at,
            revoked_at: row.revoked_at,
            revoke_reason: row.revoke_reason,
            failed_attempts: row.failed_attempts,
            max_attempts: row.max_attempts,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    event_type: String,
    activation_code_id: Option<Uuid>,
    whitelist_id: Option<Uuid>,
    identifier_attempted: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    device_id: Option<String>,
    success: bool,
    failure_reason: Option<String>,
    created_user_id: Option<Uuid>,
    request_metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let failure_reason = match row.failure_reason {
            Some(reason) => Some(
                FailureReason::parse(&reason)
                    .ok_or_else(|| anyhow::anyhow!("Unknown failure reason: {}", reason))?,
            ),
            None => None,
        };

        Ok(AuditLogEntry {
            id: row.id,
            event_type: AuditEventType::parse(&row.event_type)
                .ok_or_else(|| anyhow::anyhow!("Unknown audit event type: {}", row.event_type))?,
            activation_code_id: row.activation_code_id,
            whitelist_id: row.whitelist_id,
            identifier_attempted: row.identifier_attempted,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            device_id: row.device_id,
            success: row.success,
            failure_reason,
            created_user_id: row.created_user_id,
            request_metadata: row.request_metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CodeSummaryRow {
    pending: i64,
    active: i64,
    expired: i64,
    used: i64,
    locked: i64,
    revoked: i64,
    expiring_in_24h: i64,
}

#[derive(Debug, FromRow)]
struct AuditSummaryRow {
    total: i64,
    successful: i64,
    failed: i64,
    unique_ips: i64,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct EntryRollupRow {
    total: i64,
    activated: i64,
    mean_seconds: Option<f64>,
    median_seconds: Option<f64>,
    min_seconds: Option<f64>,
    max_seconds: Option<f64>,
}

impl EntryRollupRow {
    fn activation_times(&self) -> Option<ActivationTimes> {
        Some(ActivationTimes {
            mean_seconds: self.mean_seconds?,
            median_seconds: self.median_seconds?,
            min_seconds: self.min_seconds?,
            max_seconds: self.max_seconds?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SecurityRollupRow {
    failed_attempts: i64,
    rate_limit_violations: i64,
    blocked_ips: i64,
}

fn convert_all<R, T>(rows: Vec<R>) -> ActivationResult<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(ActivationError::Infra))
        .collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}

fn bind_audit_filter<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    filter: &'q AuditFilter,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    query
        .bind(filter.activation_code_id)
        .bind(filter.whitelist_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.event_type.map(|t| t.as_str()))
        .bind(filter.success)
        .bind(filter.ip_address.as_deref())
}

/// Postgres-backed store for entries, codes and the audit log.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WhitelistStore for PgStore {
    #[instrument(skip(self, entry), fields(whitelist_id = %entry.id))]
    async fn insert_entry(&self, entry: &WhitelistEntry) -> ActivationResult<()> {
        let _timer = QueryTimer::start("insert_entry");

        sqlx::query(
            r#"
            INSERT INTO whitelist_entries (id, identifier, identifier_type, full_name, phone,
                assigned_role, assigned_supervisor, is_activated, activated_user_id, activated_at,
                created_by, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.identifier)
        .bind(entry.identifier_type.as_str())
        .bind(&entry.full_name)
        .bind(&entry.phone)
        .bind(&entry.assigned_role)
        .bind(entry.assigned_supervisor)
        .bind(entry.is_activated)
        .bind(entry.activated_user_id)
        .bind(entry.activated_at)
        .bind(&entry.created_by)
        .bind(&entry.notes)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ActivationError::Conflict("Identifier is already whitelisted".to_string())
            } else {
                ActivationError::Infra(anyhow::Error::new(e).context("Failed to insert whitelist entry"))
            }
        })?;

        Ok(())
    }

    async fn find_entry(&self, id: Uuid) -> ActivationResult<Option<WhitelistEntry>> {
        let _timer = QueryTimer::start("find_entry");

        let row = sqlx::query_as::<_, WhitelistRow>(&format!(
            "SELECT {WHITELIST_COLUMNS} FROM whitelist_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load whitelist entry")?;

        Ok(row.map(WhitelistEntry::try_from).transpose()?)
    }

    async fn find_entries(&self, ids: &[Uuid]) -> ActivationResult<Vec<WhitelistEntry>> {
        let _timer = QueryTimer::start("find_entries");

        let rows = sqlx::query_as::<_, WhitelistRow>(&format!(
            "SELECT {WHITELIST_COLUMNS} FROM whitelist_entries WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load whitelist entries by id")?;

        convert_all(rows)
    }

    async fn find_entry_by_identifier(
        &self,
        identifier: &str,
    ) -> ActivationResult<Option<WhitelistEntry>> {
        let _timer = QueryTimer::start("find_entry_by_identifier");

        let row = sqlx::query_as::<_, WhitelistRow>(&format!(
            "SELECT {WHITELIST_COLUMNS} FROM whitelist_entries WHERE LOWER(identifier) = LOWER($1)"
        ))
        .bind(identifier.trim())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up whitelist entry by identifier")?;

        Ok(row.map(WhitelistEntry::try_from).transpose()?)
    }

    #[instrument(skip(self, entry), fields(whitelist_id = %entry.id))]
    async fn update_entry(&self, entry: &WhitelistEntry) -> ActivationResult<bool> {
        let _timer = QueryTimer::start("update_entry");

        let result = sqlx::query(
            r#"
            UPDATE whitelist_entries
            SET full_name = $2, phone = $3, assigned_role = $4, assigned_supervisor = $5,
                notes = $6, updated_at = $7
            WHERE id = $1 AND is_activated = FALSE
            "#,
        )
        .bind(entry.id)
        .bind(&entry.full_name)
        .bind(&entry.phone)
        .bind(&entry.assigned_role)
        .bind(entry.assigned_supervisor)
        .bind(&entry.notes)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to update whitelist entry")?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_entry(&self, id: Uuid) -> ActivationResult<bool> {
        let _timer = QueryTimer::start("delete_entry");

        let result = sqlx::query("DELETE FROM whitelist_entries WHERE id = $1 AND is_activated = FALSE")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    ActivationError::Conflict(
                        "Whitelist entry has activation code history and cannot be deleted"
                            .to_string(),
                    )
                } else {
                    ActivationError::Infra(anyhow::Error::new(e).context("Failed to delete whitelist entry"))
                }
            })?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_entries(
        &self,
        filter: &WhitelistFilter,
    ) -> ActivationResult<(Vec<WhitelistEntry>, u64)> {
        let _timer = QueryTimer::start("list_entries");

        let search = filter
            .search
            .as_deref()
            .map(|s| format!("%{}%", s.to_lowercase()));
        let where_clause = r#"
            ($1::boolean IS NULL OR is_activated = $1)
            AND ($2::varchar IS NULL OR LOWER(identifier) LIKE $2 OR LOWER(full_name) LIKE $2)
        "#;

        let rows = sqlx::query_as::<_, WhitelistRow>(&format!(
            "SELECT {WHITELIST_COLUMNS} FROM whitelist_entries WHERE {where_clause} \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        ))
        .bind(filter.is_activated)
        .bind(&search)
        .bind(filter.page.limit() as i64)
        .bind(filter.page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list whitelist entries")?;

        let (total,) = sqlx::query_as::<_, (i64,)>(&format!(
            "SELECT COUNT(*) FROM whitelist_entries WHERE {where_clause}"
        ))
        .bind(filter.is_activated)
        .bind(&search)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count whitelist entries")?;

        Ok((convert_all(rows)?, total as u64))
    }

    async fn entry_rollup(&self, trend_from: DateTime<Utc>) -> ActivationResult<EntryRollup> {
        let _timer = QueryTimer::start("entry_rollup");

        let row = sqlx::query_as::<_, EntryRollupRow>(
            r#"
            WITH activation AS (
                SELECT FLOOR(GREATEST(EXTRACT(EPOCH FROM activated_at - created_at), 0))::FLOAT8 AS secs
                FROM whitelist_entries
                WHERE activated_at IS NOT NULL
            )
            SELECT
                (SELECT COUNT(*) FROM whitelist_entries) AS total,
                (SELECT COUNT(*) FROM whitelist_entries WHERE is_activated) AS activated,
                AVG(secs) AS mean_seconds,
                PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY secs) AS median_seconds,
                MIN(secs) AS min_seconds,
                MAX(secs) AS max_seconds
            FROM activation
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to roll up whitelist entries")?;

        let activations_by_day = sqlx::query_as::<_, (NaiveDate, i64)>(
            r#"
            SELECT (activated_at AT TIME ZONE 'UTC')::DATE AS day, COUNT(*)
            FROM whitelist_entries
            WHERE activated_at >= $1
            GROUP BY day
            ORDER BY day
            "#,
        )
        .bind(trend_from)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count activations by day")?;

        Ok(EntryRollup {
            total: row.total as u64,
            activated: row.activated as u64,
            activation_times: row.activation_times(),
            activations_by_day: activations_by_day
                .into_iter()
                .map(|(day, count)| (day, count as u64))
                .collect(),
        })
    }
}

#[async_trait]
impl CodeStore for PgStore {
    #[instrument(skip(self, code), fields(code_id = %code.id, whitelist_id = %code.whitelist_id))]
    async fn insert_code(&self, code: &ActivationCode) -> ActivationResult<()> {
        let _timer = QueryTimer::start("insert_code");

        sqlx::query(
            r#"
            INSERT INTO activation_codes (id, whitelist_id, code_hash, status, expires_at, used_at,
                revoked_at, revoke_reason, failed_attempts, max_attempts, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(code.id)
        .bind(code.whitelist_id)
        .bind(code.code_hash.as_str())
        .bind(code.status.as_str())
        .bind(code.expires_at)
        .bind(code.used_at)
        .bind(code.revoked_at)
        .bind(&code.revoke_reason)
        .bind(code.failed_attempts)
        .bind(code.max_attempts)
        .bind(code.version)
        .bind(code.created_at)
        .bind(code.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ActivationError::Conflict(
                    "Whitelist entry already has a live activation code".to_string(),
                )
            } else if is_foreign_key_violation(&e) {
                ActivationError::not_found("Whitelist entry")
            } else {
                ActivationError::Infra(anyhow::Error::new(e).context("Failed to insert activation code"))
            }
        })?;

        Ok(())
    }

    async fn find_code(&self, id: Uuid) -> ActivationResult<Option<ActivationCode>> {
        let _timer = QueryTimer::start("find_code");

        let row = sqlx::query_as::<_, CodeRow>(&format!(
            "SELECT {CODE_COLUMNS} FROM activation_codes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load activation code")?;

        Ok(row.map(ActivationCode::try_from).transpose()?)
    }

    async fn codes_for_entry(&self, whitelist_id: Uuid) -> ActivationResult<Vec<ActivationCode>> {
        self.codes_for_entries(&[whitelist_id]).await
    }

    async fn codes_for_entries(
        &self,
        whitelist_ids: &[Uuid],
    ) -> ActivationResult<Vec<ActivationCode>> {
        let _timer = QueryTimer::start("codes_for_entries");

        let rows = sqlx::query_as::<_, CodeRow>(&format!(
            "SELECT {CODE_COLUMNS} FROM activation_codes WHERE whitelist_id = ANY($1) \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(whitelist_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load activation codes for entries")?;

        convert_all(rows)
    }

    #[instrument(skip(self, code), fields(code_id = %code.id, version = code.version, status = %code.status))]
    async fn update_code(&self, code: &ActivationCode) -> ActivationResult<bool> {
        let _timer = QueryTimer::start("update_code");

        let result = sqlx::query(
            r#"
            UPDATE activation_codes
            SET code_hash = $3, status = $4, expires_at = $5, used_at = $6, revoked_at = $7,
                revoke_reason = $8, failed_attempts = $9, max_attempts = $10, updated_at = $11,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(code.id)
        .bind(code.version)
        .bind(code.code_hash.as_str())
        .bind(code.status.as_str())
        .bind(code.expires_at)
        .bind(code.used_at)
        .bind(code.revoked_at)
        .bind(&code.revoke_reason)
        .bind(code.failed_attempts)
        .bind(code.max_attempts)
        .bind(code.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ActivationError::Conflict(
                    "Whitelist entry already has a live activation code".to_string(),
                )
            } else {
                ActivationError::Infra(anyhow::Error::new(e).context("Failed to update activation code"))
            }
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, code), fields(code_id = %code.id, whitelist_id = %code.whitelist_id))]
    async fn consume_code(
        &self,
        code: &ActivationCode,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> ActivationResult<bool> {
        let _timer = QueryTimer::start("consume_code");

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin activation transaction")?;

        let code_result = sqlx::query(
            r#"
            UPDATE activation_codes
            SET status = $3, used_at = $4, updated_at = $4, version = version + 1
            WHERE id = $1 AND version = $2 AND status = 'active'
            "#,
        )
        .bind(code.id)
        .bind(code.version)
        .bind(code.status.as_str())
        .bind(code.used_at.unwrap_or(now))
        .execute(&mut *tx)
        .await
        .context("Failed to mark activation code used")?;

        if code_result.rows_affected() != 1 {
            tx.rollback().await.context("Failed to roll back activation")?;
            return Ok(false);
        }

        let entry_result = sqlx::query(
            r#"
            UPDATE whitelist_entries
            SET is_activated = TRUE, activated_user_id = $2, activated_at = $3, updated_at = $3
            WHERE id = $1 AND is_activated = FALSE
            "#,
        )
        .bind(code.whitelist_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to activate whitelist entry")?;

        if entry_result.rows_affected() != 1 {
            tx.rollback().await.context("Failed to roll back activation")?;
            return Ok(false);
        }

        tx.commit().await.context("Failed to commit activation")?;
        Ok(true)
    }

    async fn list_codes(
        &self,
        filter: &CodeFilter,
        now: DateTime<Utc>,
    ) -> ActivationResult<(Vec<ActivationCode>, u64)> {
        let _timer = QueryTimer::start("list_codes");

        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, CodeRow>(&format!(
            "SELECT {CODE_COLUMNS} FROM activation_codes WHERE {CODE_FILTER_WHERE} \
             ORDER BY created_at DESC, id DESC LIMIT $5 OFFSET $6"
        ))
        .bind(status)
        .bind(now)
        .bind(filter.whitelist_id)
        .bind(filter.expiring_soon)
        .bind(filter.page.limit() as i64)
        .bind(filter.page.offset() as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list activation codes")?;

        let (total,) = sqlx::query_as::<_, (i64,)>(&format!(
            "SELECT COUNT(*) FROM activation_codes WHERE {CODE_FILTER_WHERE}"
        ))
        .bind(status)
        .bind(now)
        .bind(filter.whitelist_id)
        .bind(filter.expiring_soon)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count activation codes")?;

        Ok((convert_all(rows)?, total as u64))
    }

    async fn code_summary(&self, now: DateTime<Utc>) -> ActivationResult<CodeSummary> {
        let _timer = QueryTimer::start("code_summary");

        let row = sqlx::query_as::<_, CodeSummaryRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'active' AND expires_at > $1) AS active,
                COUNT(*) FILTER (WHERE status = 'expired' OR (status = 'active' AND expires_at <= $1)) AS expired,
                COUNT(*) FILTER (WHERE status = 'used') AS used,
                COUNT(*) FILTER (WHERE status = 'locked') AS locked,
                COUNT(*) FILTER (WHERE status = 'revoked') AS revoked,
                COUNT(*) FILTER (WHERE (status = 'pending' OR (status = 'active' AND expires_at > $1))
                                   AND expires_at <= $1 + INTERVAL '24 hours') AS expiring_in_24h
            FROM activation_codes
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to summarize activation codes")?;

        Ok(CodeSummary {
            pending: row.pending as u64,
            active: row.active as u64,
            expired: row.expired as u64,
            used: row.used as u64,
            locked: row.locked as u64,
            revoked: row.revoked as u64,
            expiring_in_24h: row.expiring_in_24h as u64,
        })
    }

    async fn overdue_codes(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ActivationResult<Vec<ActivationCode>> {
        let _timer = QueryTimer::start("overdue_codes");

        let rows = sqlx::query_as::<_, CodeRow>(&format!(
            "SELECT {CODE_COLUMNS} FROM activation_codes \
             WHERE status = 'active' AND expires_at <= $1 ORDER BY expires_at LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load overdue activation codes")?;

        convert_all(rows)
    }

    async fn code_rollup(&self, now: DateTime<Utc>) -> ActivationResult<CodeRollup> {
        let summary = self.code_summary(now).await?;

        let _timer = QueryTimer::start("code_rollup");
        let (attempts,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COALESCE(SUM(failed_attempts), 0)::BIGINT \
                + COUNT(*) FILTER (WHERE status = 'used') \
             FROM activation_codes",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count activation attempts")?;

        Ok(CodeRollup {
            summary,
            attempts: attempts.max(0) as u64,
        })
    }

    async fn ping(&self) -> ActivationResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, entry: &AuditLogEntry) -> ActivationResult<()> {
        let _timer = QueryTimer::start("append_audit");

        sqlx::query(
            r#"
            INSERT INTO activation_audit_log (id, event_type, activation_code_id, whitelist_id,
                identifier_attempted, ip_address, user_agent, device_id, success, failure_reason,
                created_user_id, request_metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_type.as_str())
        .bind(entry.activation_code_id)
        .bind(entry.whitelist_id)
        .bind(&entry.identifier_attempted)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.device_id)
        .bind(entry.success)
        .bind(entry.failure_reason.map(|r| r.as_str()))
        .bind(entry.created_user_id)
        .bind(&entry.request_metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to append audit entry")?;

        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> ActivationResult<(Vec<AuditLogEntry>, u64)> {
        let _timer = QueryTimer::start("query_audit");

        let select = format!(
            "SELECT {AUDIT_COLUMNS} FROM activation_audit_log WHERE {AUDIT_FILTER_WHERE} \
             ORDER BY created_at DESC, id DESC LIMIT $8 OFFSET $9"
        );
        let rows = bind_audit_filter(sqlx::query_as::<_, AuditRow>(&select), filter)
            .bind(filter.page.limit() as i64)
            .bind(filter.page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to query audit log")?;

        let count = format!("SELECT COUNT(*) FROM activation_audit_log WHERE {AUDIT_FILTER_WHERE}");
        let (total,) = bind_audit_filter(sqlx::query_as::<_, (i64,)>(&count), filter)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count audit log")?;

        Ok((convert_all(rows)?, total as u64))
    }

    async fn summarize(&self, filter: &AuditFilter) -> ActivationResult<AuditSummary> {
        let _timer = QueryTimer::start("summarize_audit");

        let sql = format!(
            "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE success) AS successful, \
                COUNT(*) FILTER (WHERE NOT success) AS failed, \
                COUNT(DISTINCT ip_address) AS unique_ips, \
                MIN(created_at) AS earliest, \
                MAX(created_at) AS latest \
             FROM activation_audit_log WHERE {AUDIT_FILTER_WHERE}"
        );
        let row = bind_audit_filter(sqlx::query_as::<_, AuditSummaryRow>(&sql), filter)
            .fetch_one(&self.pool)
            .await
            .context("Failed to summarize audit log")?;

        Ok(AuditSummary {
            total: row.total as u64,
            successful: row.successful as u64,
            failed: row.failed as u64,
            unique_ips: row.unique_ips as u64,
            earliest: row.earliest,
            latest: row.latest,
        })
    }

    async fn security_rollup(&self, since: DateTime<Utc>) -> ActivationResult<SecurityRollup> {
        let _timer = QueryTimer::start("security_rollup");

        let row = sqlx::query_as::<_, SecurityRollupRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE event_type = $2) AS failed_attempts,
                COUNT(*) FILTER (WHERE event_type = $3 OR failure_reason = $4) AS rate_limit_violations,
                COUNT(DISTINCT ip_address) FILTER (WHERE event_type = $3 OR failure_reason = $4)
                    AS blocked_ips
            FROM activation_audit_log
            WHERE created_at >= $1
            "#,
        )
        .bind(since)
        .bind(AuditEventType::ActivationFailed.as_str())
        .bind(AuditEventType::RateLimitExceeded.as_str())
        .bind(FailureReason::RateLimited.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to roll up recent audit events")?;

        Ok(SecurityRollup {
            failed_attempts: row.failed_attempts as u64,
            rate_limit_violations: row.rate_limit_violations as u64,
            blocked_ips: row.blocked_ips as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdentifierType, NewWhitelistEntry};
    use chrono::Duration;

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/activation_test".to_string());
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        PgStore::new(pool)
    }

    fn entry() -> WhitelistEntry {
        WhitelistEntry::new(
            NewWhitelistEntry {
                identifier: format!("{}@example.com", Uuid::new_v4()),
                identifier_type: IdentifierType::Email,
                full_name: "Katherine Johnson".to_string(),
                phone: None,
                assigned_role: "enumerator".to_string(),
                assigned_supervisor: None,
                created_by: None,
                notes: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_partial_index_rejects_second_live_code() {
        let store = store().await;
        let entry = entry();
        store.insert_entry(&entry).await.unwrap();

        let now = Utc::now();
        let hash = CodeHash::new("$argon2id$stub".to_string());
        let first = ActivationCode::new(entry.id, hash.clone(), now + Duration::hours(1), 5, now);
        let second = ActivationCode::new(entry.id, hash, now + Duration::hours(1), 5, now);

        store.insert_code(&first).await.unwrap();
        let err = store.insert_code(&second).await.unwrap_err();
        assert!(matches!(err, ActivationError::Conflict(_)));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_update_code_is_version_checked() {
        let store = store().await;
        let entry = entry();
        store.insert_entry(&entry).await.unwrap();

        let now = Utc::now();
        let code = ActivationCode::new(
            entry.id,
            CodeHash::new("$argon2id$stub".to_string()),
            now + Duration::hours(1),
            5,
            now,
        );
        store.insert_code(&code).await.unwrap();

        let mut bumped = code.clone();
        bumped.failed_attempts = 1;
        assert!(store.update_code(&bumped).await.unwrap());
        assert!(!store.update_code(&bumped).await.unwrap());

        let stored = store.find_code(code.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_rollups_count_in_sql() {
        use crate::models::{AuditEvent, AuditEventType, FailureReason, RequestContext};

        let store = store().await;
        let now = Utc::now();
        let since = now - Duration::hours(24);
        let entries_before = store.entry_rollup(since).await.unwrap();
        let security_before = store.security_rollup(since).await.unwrap();

        let mut activated = entry();
        activated.mark_activated(Uuid::new_v4(), activated.created_at + Duration::hours(2));
        store.insert_entry(&activated).await.unwrap();
        store.insert_entry(&entry()).await.unwrap();

        let ip = format!("198.51.100.{}", now.timestamp_subsec_micros() % 250);
        let throttled = AuditEvent::new(AuditEventType::RateLimitExceeded)
            .failed(FailureReason::RateLimited)
            .context(&RequestContext::with_ip(ip))
            .into_entry(now);
        store.append(&throttled).await.unwrap();

        let entries_after = store.entry_rollup(since).await.unwrap();
        assert_eq!(entries_after.total, entries_before.total + 2);
        assert_eq!(entries_after.activated, entries_before.activated + 1);
        assert!(entries_after.activation_times.is_some());

        let security_after = store.security_rollup(since).await.unwrap();
        assert_eq!(
            security_after.rate_limit_violations,
            security_before.rate_limit_violations + 1
        );
        assert!(security_after.blocked_ips >= 1);
    }
}
