use service_core::middleware::rate_limit::{
    check_key, create_keyed_rate_limiter, prune, KeyedRateLimiter,
};
use std::time::Duration;

use crate::config::RateLimitConfig;

/// Which budget a rejected validation request exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    Ip,
    Identifier,
}

impl ThrottleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleScope::Ip => "ip",
            ThrottleScope::Identifier => "identifier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRejection {
    pub scope: ThrottleScope,
    pub retry_after: Duration,
}

/// Request-rate budgets for code validation, independent of per-code attempt counters.
#[derive(Clone)]
pub struct ValidationThrottle {
    by_ip: KeyedRateLimiter,
    by_identifier: KeyedRateLimiter,
}

impl ValidationThrottle {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            by_ip: create_keyed_rate_limiter(
                config.validate_ip_attempts,
                config.validate_ip_window_seconds,
            ),
            by_identifier: create_keyed_rate_limiter(
                config.validate_identifier_attempts,
                config.validate_identifier_window_seconds,
            ),
        }
    }

    /// IP budget first, then the identifier budget. A request without a known IP is only
    /// subject to the identifier budget.
    pub fn check(&self, ip: Option<&str>, identifier: &str) -> Result<(), ThrottleRejection> {
        if let Some(ip) = ip {
            check_key(&self.by_ip, ip).map_err(|retry_after| ThrottleRejection {
                scope: ThrottleScope::Ip,
                retry_after,
            })?;
        }

        let identifier_key = crate::models::whitelist_entry::identifier_key(identifier);
        check_key(&self.by_identifier, &identifier_key).map_err(|retry_after| ThrottleRejection {
            scope: ThrottleScope::Identifier,
            retry_after,
        })
    }

    /// Forget IPs and identifiers whose budget is full again. Returns the keys still tracked.
    pub fn prune(&self) -> usize {
        prune(&self.by_ip) + prune(&self.by_identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(ip_attempts: u32, identifier_attempts: u32) -> ValidationThrottle {
        ValidationThrottle::new(&RateLimitConfig {
            validate_ip_attempts: ip_attempts,
            validate_ip_window_seconds: 60,
            validate_identifier_attempts: identifier_attempts,
            validate_identifier_window_seconds: 60,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_ip_budget_checked_first() {
        let throttle = throttle(1, 10);
        assert!(throttle.check(Some("198.51.100.1"), "a@example.com").is_ok());

        let rejection = throttle.check(Some("198.51.100.1"), "b@example.com").unwrap_err();
        assert_eq!(rejection.scope, ThrottleScope::Ip);
    }

    #[test]
    fn test_identifier_budget_is_case_insensitive() {
        let throttle = throttle(100, 2);
        assert!(throttle.check(Some("198.51.100.1"), "a@example.com").is_ok());
        assert!(throttle.check(Some("198.51.100.2"), "A@Example.com").is_ok());

        let rejection = throttle.check(Some("198.51.100.3"), "a@EXAMPLE.com").unwrap_err();
        assert_eq!(rejection.scope, ThrottleScope::Identifier);
        assert!(rejection.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_prune_forgets_idle_identifiers() {
        let throttle = ValidationThrottle::new(&RateLimitConfig {
            validate_ip_attempts: 10,
            validate_ip_window_seconds: 1,
            validate_identifier_attempts: 10,
            validate_identifier_window_seconds: 1,
            ..RateLimitConfig::default()
        });
        for n in 0..50 {
            let identifier = format!("guess-{}@example.com", n);
            assert!(throttle.check(None, &identifier).is_ok());
        }

        std::thread::sleep(Duration::from_millis(1200));
        assert_eq!(throttle.prune(), 0);
    }

    #[test]
    fn test_missing_ip_uses_identifier_budget_only() {
        let throttle = throttle(1, 3);
        assert!(throttle.check(None, "a@example.com").is_ok());
        assert!(throttle.check(None, "a@example.com").is_ok());
    }
}
