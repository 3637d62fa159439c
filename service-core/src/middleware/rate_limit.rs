use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use crate::error::AppError;
use std::{hash::Hash, net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by IP address
pub type IpRateLimiter = Arc<RateLimiter<SocketAddr, DashMapStateStore<SocketAddr>, DefaultClock>>;

/// Rate limiter keyed by an arbitrary string (identifier, normalized IP text, ...)
pub type KeyedRateLimiter = Arc<RateLimiter<String, DashMapStateStore<String>, DefaultClock>>;

/// Quota allowing `attempts` cells per `window_seconds`, replenished evenly across the window.
fn window_quota(attempts: u32, window_seconds: u64) -> Quota {
    let attempts = attempts.max(1);
    let period = Duration::from_millis(((window_seconds.max(1) * 1000) / attempts as u64).max(1));
    Quota::with_period(period)
        .expect("Failed to create quota with valid period")
        .allow_burst(NonZeroU32::new(attempts).expect("attempts is guaranteed to be non-zero"))
}

/// Create a keyed rate limiter (by IP)
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    Arc::new(RateLimiter::dashmap(window_quota(attempts, window_seconds)))
}

/// Create a rate limiter keyed by string
pub fn create_keyed_rate_limiter(attempts: u32, window_seconds: u64) -> KeyedRateLimiter {
    Arc::new(RateLimiter::dashmap(window_quota(attempts, window_seconds)))
}

/// Consume one cell for `key`. On rejection returns how long until the next cell frees up.
pub fn check_key(limiter: &KeyedRateLimiter, key: &str) -> Result<(), Duration> {
    limiter
        .check_key(&key.to_string())
        .map_err(|negative| negative.wait_time_from(DefaultClock::default().now()))
}

/// Drop keys whose budget has fully replenished and return how many remain.
/// Keyed limiters never forget a key on their own, so call this periodically.
pub fn prune<K>(limiter: &RateLimiter<K, DashMapStateStore<K>, DefaultClock>) -> usize
where
    K: Hash + Eq + Clone,
{
    limiter.retain_recent();
    limiter.shrink_to_fit();
    limiter.len()
}

/// Best-effort client address: first `x-forwarded-for` hop, else the socket peer.
pub fn client_addr(request: &Request) -> Option<SocketAddr> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok());

    if let Some(ip) = forwarded_ip {
        Some(SocketAddr::new(ip, 0))
    } else {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|axum::extract::ConnectInfo(addr)| SocketAddr::new(addr.ip(), 0))
    }
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_addr(&request) {
        Some(addr) => match limiter.check_key(&addr) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                Err(AppError::TooManyRequests(
                    "Too many requests from this IP. Please try again later.".to_string(),
                    Some(wait_time.as_secs().max(1)),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}
