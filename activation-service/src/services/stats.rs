//! Read-only rollups over whitelist entries, codes and the recent audit trail.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use crate::services::error::ActivationResult;
use crate::services::store::{
    ActivationRepository, ActivationTimes, CodeRollup, EntryRollup, SecurityRollup,
};

const TREND_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActivationStats {
    pub overview: OverviewStats,
    pub codes: CodeStats,
    pub time_metrics: TimeMetrics,
    pub security: SecurityStats,
    pub trends: Trends,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OverviewStats {
    pub total_whitelisted: u64,
    pub total_activated: u64,
    pub pending_activation: u64,
    pub activation_rate_pct: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CodeStats {
    pub total_generated: u64,
    pub active_codes: u64,
    pub expired_codes: u64,
    pub used_codes: u64,
    pub locked_codes: u64,
    pub revoked_codes: u64,
    pub expiring_in_24h: u64,
    /// Failed attempts plus the redeeming attempt, averaged over all codes.
    pub average_attempts_per_code: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TimeMetrics {
    pub avg_activation_time_hours: Option<f64>,
    pub median_activation_time_hours: Option<f64>,
    pub fastest_activation_minutes: Option<f64>,
    pub slowest_activation_days: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SecurityStats {
    pub failed_attempts_24h: u64,
    pub locked_codes: u64,
    pub rate_limit_violations_24h: u64,
    /// Distinct IPs that hit a validation rate limit in the last 24 hours.
    pub blocked_ips: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Trends {
    pub activations_by_day: Vec<DailyCount>,
}

#[derive(Clone)]
pub struct StatsAggregator {
    repo: Arc<dyn ActivationRepository>,
}

impl StatsAggregator {
    pub fn new(repo: Arc<dyn ActivationRepository>) -> Self {
        Self { repo }
    }

    /// Counts are computed by the storage backend; nothing here loads whole tables.
    #[tracing::instrument(skip(self))]
    pub async fn collect(&self) -> ActivationResult<ActivationStats> {
        let now = Utc::now();
        let entries = self.repo.entry_rollup(trend_start(now)).await?;
        let codes = self.repo.code_rollup(now).await?;
        let security = self.repo.security_rollup(now - Duration::hours(24)).await?;
        Ok(summarize(&entries, &codes, &security, now))
    }
}

/// Midnight (UTC) of the oldest trend day.
pub fn trend_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive() - Duration::days(TREND_DAYS - 1);
    first.and_time(NaiveTime::MIN).and_utc()
}

/// Pure assembly of the report from backend rollups.
pub fn summarize(
    entries: &EntryRollup,
    codes: &CodeRollup,
    security: &SecurityRollup,
    now: DateTime<Utc>,
) -> ActivationStats {
    let total_whitelisted = entries.total;
    let total_activated = entries.activated;
    let activation_rate_pct = if total_whitelisted == 0 {
        0.0
    } else {
        round2(total_activated as f64 * 100.0 / total_whitelisted as f64)
    };

    let summary = &codes.summary;
    let total_generated = summary.total();
    let average_attempts_per_code = if total_generated == 0 {
        0.0
    } else {
        round2(codes.attempts as f64 / total_generated as f64)
    };

    ActivationStats {
        overview: OverviewStats {
            total_whitelisted,
            total_activated,
            pending_activation: total_whitelisted.saturating_sub(total_activated),
            activation_rate_pct,
        },
        codes: CodeStats {
            total_generated,
            active_codes: summary.active + summary.pending,
            expired_codes: summary.expired,
            used_codes: summary.used,
            locked_codes: summary.locked,
            revoked_codes: summary.revoked,
            expiring_in_24h: summary.expiring_in_24h,
            average_attempts_per_code,
        },
        time_metrics: entries
            .activation_times
            .map(time_metrics)
            .unwrap_or_default(),
        security: SecurityStats {
            failed_attempts_24h: security.failed_attempts,
            locked_codes: summary.locked,
            rate_limit_violations_24h: security.rate_limit_violations,
            blocked_ips: security.blocked_ips,
        },
        trends: Trends {
            activations_by_day: activations_by_day(&entries.activations_by_day, now),
        },
        generated_at: now,
    }
}

fn time_metrics(times: ActivationTimes) -> TimeMetrics {
    TimeMetrics {
        avg_activation_time_hours: Some(round2(times.mean_seconds / 3600.0)),
        median_activation_time_hours: Some(round2(times.median_seconds / 3600.0)),
        fastest_activation_minutes: Some(round2(times.min_seconds / 60.0)),
        slowest_activation_days: Some(round2(times.max_seconds / 86_400.0)),
    }
}

/// One bucket per calendar day (UTC) for the trailing window, oldest first, zeros included.
fn activations_by_day(counts: &[(NaiveDate, u64)], now: DateTime<Utc>) -> Vec<DailyCount> {
    let first = trend_start(now).date_naive();

    let mut buckets: BTreeMap<NaiveDate, u64> = (0..TREND_DAYS)
        .map(|offset| (first + Duration::days(offset), 0))
        .collect();
    for (day, count) in counts {
        if let Some(bucket) = buckets.get_mut(day) {
            *bucket += count;
        }
    }

    buckets
        .into_iter()
        .map(|(date, count)| DailyCount { date, count })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
