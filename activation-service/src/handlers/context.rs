//! Client context captured for the audit trail.

use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header::USER_AGENT, request::Parts, HeaderMap},
};
use service_core::middleware::tracing::request_id;

use crate::models::RequestContext;

/// Header carrying the operator identity for admin actions.
pub const ACTOR_HEADER: &str = "x-actor";

const MAX_HEADER_CHARS: usize = 512;

/// Extracts [`RequestContext`] from forwarding headers, the socket peer, the user agent,
/// the request id and the acting operator. Never rejects.
#[derive(Debug, Clone, Default)]
pub struct ClientContext(pub RequestContext);

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(MAX_HEADER_CHARS).collect())
}

/// First `x-forwarded-for` hop if it parses as an IP, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| ip.to_string())
}

pub fn request_context(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestContext {
    RequestContext {
        ip_address: client_ip(headers, peer),
        user_agent: header_text(headers, USER_AGENT.as_str()),
        device_id: None,
        request_id: request_id(headers).map(str::to_string),
        actor: header_text(headers, ACTOR_HEADER),
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientContext(request_context(&parts.headers, peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_garbage_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("10.0.0.9"));
        assert_eq!(client_ip(&headers, None), None);
    }

    #[test]
    fn test_context_reads_agent_request_id_and_actor() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("field-app/2.1"));
        headers.insert("x-request-id", HeaderValue::from_static("req-42"));
        headers.insert(ACTOR_HEADER, HeaderValue::from_static("ops@example.com"));

        let ctx = request_context(&headers, None);
        assert_eq!(ctx.user_agent.as_deref(), Some("field-app/2.1"));
        assert_eq!(ctx.request_id.as_deref(), Some("req-42"));
        assert_eq!(ctx.actor.as_deref(), Some("ops@example.com"));
        assert!(ctx.ip_address.is_none());
    }
}
