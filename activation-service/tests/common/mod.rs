//! Test helper module for activation-service integration tests.
//!
//! Builds the service over the in-memory backend with cheap hashing parameters.

#![allow(dead_code)]

use activation_service::{
    build_router, build_state,
    config::{ActivationConfig, CodePolicy, RateLimitConfig},
    models::{IdentifierType, NewWhitelistEntry, RequestContext, WhitelistEntry},
    services::{
        ActivationRepository, CodeDelivery, CodeMailer, GenerateRequest, GeneratedCode,
        HashParams, MemoryStore, ValidateRequest, ValidationOutcome,
    },
    AppState,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;
use uuid::Uuid;

/// A delivered code, as the recipient would see it.
#[derive(Debug, Clone)]
pub struct SentCode {
    pub to: String,
    pub code: String,
    pub custom_message: Option<String>,
}

/// Mailer that keeps every delivery in memory and can be told to fail.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<SentCode>>,
    pub fail: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentCode> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CodeMailer for RecordingMailer {
    async fn send_activation_code(&self, delivery: CodeDelivery<'_>) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("SMTP relay unavailable".to_string());
        }
        self.sent.lock().unwrap().push(SentCode {
            to: delivery.to_email.to_string(),
            code: delivery.code.expose_secret().clone(),
            custom_message: delivery.custom_message.map(str::to_string),
        });
        Ok(())
    }
}

pub fn test_config() -> ActivationConfig {
    ActivationConfig {
        hashing: HashParams::insecure_fast(),
        codes: CodePolicy::default(),
        rate_limit: RateLimitConfig {
            validate_ip_attempts: 1_000,
            validate_ip_window_seconds: 60,
            validate_identifier_attempts: 1_000,
            validate_identifier_window_seconds: 60,
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        },
        log_level: "error".to_string(),
        ..ActivationConfig::default()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub mailer: Arc<RecordingMailer>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: ActivationConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::spawn_over(config, store).await
    }

    pub async fn spawn_over(config: ActivationConfig, store: Arc<MemoryStore>) -> Self {
        let mailer = Arc::new(RecordingMailer::default());
        let state = build_state(config, store.clone(), mailer.clone())
            .expect("Failed to build application state");
        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");

        Self {
            state,
            router,
            store,
            mailer,
        }
    }

    pub fn repo(&self) -> Arc<dyn ActivationRepository> {
        self.state.repo.clone()
    }

    pub async fn create_entry(&self, identifier: &str) -> WhitelistEntry {
        self.state
            .whitelist
            .create(new_entry(identifier))
            .await
            .expect("Failed to create whitelist entry")
            .entry
    }

    pub async fn generate(&self, whitelist_id: Uuid, ttl_hours: i64) -> GeneratedCode {
        self.state
            .engine
            .generate(
                GenerateRequest {
                    whitelist_id,
                    ttl_hours: Some(ttl_hours),
                    send_email: false,
                    custom_message: None,
                },
                &admin_context(),
            )
            .await
            .expect("Failed to generate code")
    }

    pub async fn validate(&self, code: &str, identifier: &str) -> ValidationOutcome {
        self.validate_from(code, identifier, "198.51.100.10").await
    }

    pub async fn validate_from(&self, code: &str, identifier: &str, ip: &str) -> ValidationOutcome {
        self.state
            .engine
            .validate(ValidateRequest {
                code: SecretString::new(code.to_string()),
                identifier: identifier.to_string(),
                context: RequestContext::with_ip(ip),
            })
            .await
            .expect("Validation returned an error")
    }

    /// Send a JSON request through the full middleware stack.
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, HeaderMap, serde_json::Value) {
        self.request_with_headers(method, uri, body, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, headers, json)
    }
}

pub fn new_entry(identifier: &str) -> NewWhitelistEntry {
    NewWhitelistEntry {
        identifier: identifier.to_string(),
        identifier_type: IdentifierType::Email,
        full_name: "Dana Field".to_string(),
        phone: Some("+15550100".to_string()),
        assigned_role: "field_agent".to_string(),
        assigned_supervisor: None,
        created_by: Some("ops@example.com".to_string()),
        notes: None,
    }
}

pub fn admin_context() -> RequestContext {
    RequestContext {
        actor: Some("ops@example.com".to_string()),
        ..RequestContext::with_ip("192.0.2.1")
    }
}

/// A well-formed code that is vanishingly unlikely to match a generated one.
pub const WRONG_CODE: &str = "AAAA-AAAA-AAAA";
