use axum::http::{HeaderMap, HeaderValue};
use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Request id propagated by the caller, if any.
pub fn request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(REQUEST_ID_HEADER).and_then(|h| h.to_str().ok())
}

fn acceptable(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| b.is_ascii_graphic())
}

/// Keeps a well-formed caller id, otherwise mints one, and echoes it on the response.
/// Oversized ids and ids with non-printable bytes are replaced.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = match request_id(req.headers()) {
        Some(id) if acceptable(id) => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    let header_value = HeaderValue::from_str(&id).ok();

    if let Some(value) = header_value.clone() {
        req.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let mut response = next.run(req).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptable_request_ids() {
        assert!(acceptable("req-42"));
        assert!(acceptable(&Uuid::new_v4().to_string()));
        assert!(!acceptable(""));
        assert!(!acceptable("has space"));
        assert!(!acceptable(&"x".repeat(MAX_REQUEST_ID_LEN + 1)));
    }
}
