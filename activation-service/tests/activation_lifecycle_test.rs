mod common;

use activation_service::models::{AuditEventType, CodeStatus, FailureReason};
use activation_service::services::{
    ActivationError, AuditFilter, GenerateRequest, ValidateRequest, ValidationOutcome,
};
use chrono::{Duration, Utc};
use common::{admin_context, TestApp, WRONG_CODE};
use secrecy::{ExposeSecret, SecretString};

fn failure(outcome: ValidationOutcome) -> activation_service::services::ValidationFailure {
    match outcome {
        ValidationOutcome::Failure(f) => f,
        ValidationOutcome::Success(_) => panic!("expected a failed validation"),
    }
}

#[tokio::test]
async fn test_generate_then_validate_round_trip() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;

    let expected_expiry = Utc::now() + Duration::hours(24);
    assert!((generated.expires_at - expected_expiry).num_seconds().abs() < 5);

    let outcome = app
        .validate(generated.code.expose_secret(), "dana@example.com")
        .await;
    let grant = match outcome {
        ValidationOutcome::Success(grant) => grant,
        ValidationOutcome::Failure(f) => panic!("validation failed: {:?}", f),
    };
    assert_eq!(grant.whitelist_id, entry.id);
    assert_eq!(grant.code_id, generated.code_id);
    assert_eq!(grant.profile.assigned_role, "field_agent");

    let stored_entry = app.repo().find_entry(entry.id).await.unwrap().unwrap();
    assert!(stored_entry.is_activated);
    assert_eq!(stored_entry.activated_user_id, Some(grant.user_id));

    let code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(code.status, CodeStatus::Used);
    assert!(code.used_at.is_some());

    // Used is terminal: the same code never succeeds again.
    let again = failure(
        app.validate(generated.code.expose_secret(), "dana@example.com")
            .await,
    );
    assert_eq!(again.reason, FailureReason::AlreadyUsed);
}

#[tokio::test]
async fn test_code_input_is_normalized_and_identifier_case_insensitive() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("Dana@Example.com").await;
    let generated = app.generate(entry.id, 24).await;

    let typed = generated
        .code
        .expose_secret()
        .replace('-', " ")
        .to_lowercase();
    let outcome = app.validate(&typed, "  dana@EXAMPLE.com ").await;
    assert!(matches!(outcome, ValidationOutcome::Success(_)));
}

#[tokio::test]
async fn test_five_strike_lockout() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;

    for attempt in 1..=4 {
        let f = failure(app.validate(WRONG_CODE, "dana@example.com").await);
        assert_eq!(f.reason, FailureReason::InvalidCode);
        assert_eq!(f.remaining_attempts, Some(5 - attempt));
        assert_eq!(f.near_limit, attempt == 4);
    }

    let code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(code.failed_attempts, 4);
    assert_eq!(code.status, CodeStatus::Active);

    let fifth = failure(app.validate(WRONG_CODE, "dana@example.com").await);
    assert_eq!(fifth.reason, FailureReason::InvalidCode);
    assert_eq!(fifth.remaining_attempts, Some(0));

    let code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(code.failed_attempts, 5);
    assert_eq!(code.status, CodeStatus::Locked);

    // The right code no longer helps, and the reason is the lock, not a mismatch.
    let locked = failure(
        app.validate(generated.code.expose_secret(), "dana@example.com")
            .await,
    );
    assert_eq!(locked.reason, FailureReason::Locked);

    let counter_after = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(counter_after.failed_attempts, 5);

    let (locked_events, _) = app
        .repo()
        .query(&AuditFilter {
            event_type: Some(AuditEventType::CodeLocked),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(locked_events.len(), 1);
    assert_eq!(locked_events[0].activation_code_id, Some(generated.code_id));
}

#[tokio::test]
async fn test_unknown_identifier_and_malformed_code() {
    let app = TestApp::spawn().await;

    let f = failure(app.validate(WRONG_CODE, "nobody@example.com").await);
    assert_eq!(f.reason, FailureReason::NotFound);
    assert_eq!(f.remaining_attempts, None);

    let entry = app.create_entry("dana@example.com").await;
    let f = failure(app.validate(WRONG_CODE, "dana@example.com").await);
    assert_eq!(f.reason, FailureReason::NotFound, "entry without a code");

    app.generate(entry.id, 24).await;
    let err = app
        .state
        .engine
        .validate(ValidateRequest {
            code: SecretString::new("short".to_string()),
            identifier: "dana@example.com".to_string(),
            context: admin_context(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Validation(_)));
}

#[tokio::test]
async fn test_generate_rejects_second_live_code_and_bad_ttl() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let first = app.generate(entry.id, 24).await;

    let request = |ttl_hours| GenerateRequest {
        whitelist_id: entry.id,
        ttl_hours: Some(ttl_hours),
        send_email: false,
        custom_message: None,
    };

    let err = app
        .state
        .engine
        .generate(request(24), &admin_context())
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Conflict(_)));

    for ttl in [0, 721] {
        let err = app
            .state
            .engine
            .generate(request(ttl), &admin_context())
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::Validation(_)), "ttl {}", ttl);
    }

    app.state
        .engine
        .revoke(first.code_id, "Issued to wrong address", &admin_context())
        .await
        .unwrap();
    let second = app.generate(entry.id, 48).await;
    assert_ne!(second.code_id, first.code_id);

    // The revoked code stays dead.
    let f = failure(app.validate(first.code.expose_secret(), "dana@example.com").await);
    assert_eq!(f.reason, FailureReason::InvalidCode);
}

#[tokio::test]
async fn test_generate_for_activated_entry_conflicts() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;
    app.validate(generated.code.expose_secret(), "dana@example.com")
        .await;

    let err = app
        .state
        .engine
        .generate(
            GenerateRequest {
                whitelist_id: entry.id,
                ttl_hours: None,
                send_email: false,
                custom_message: None,
            },
            &admin_context(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Conflict(_)));

    let err = app
        .state
        .engine
        .generate(
            GenerateRequest {
                whitelist_id: uuid::Uuid::new_v4(),
                ttl_hours: None,
                send_email: false,
                custom_message: None,
            },
            &admin_context(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::NotFound(_)));
}

#[tokio::test]
async fn test_expired_code_fails_and_sweep_persists_expiry_once() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 1).await;

    let mut code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    code.expires_at = Utc::now() - Duration::minutes(1);
    assert!(app.repo().update_code(&code).await.unwrap());

    let f = failure(app.validate(generated.code.expose_secret(), "dana@example.com").await);
    assert_eq!(f.reason, FailureReason::Expired);

    // Validation reads expiry lazily and does not persist it.
    let stored = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CodeStatus::Active);

    assert_eq!(app.state.engine.sweep_expired().await.unwrap(), 1);
    assert_eq!(app.state.engine.sweep_expired().await.unwrap(), 0);

    let stored = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CodeStatus::Expired);

    let (expired_events, _) = app
        .repo()
        .query(&AuditFilter {
            event_type: Some(AuditEventType::CodeExpired),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(expired_events.len(), 1);
    assert_eq!(
        expired_events[0].request_metadata["actor"],
        serde_json::json!("expiry-sweeper")
    );

    // A fresh code may be issued once the old one is dead.
    app.generate(entry.id, 24).await;
}

#[tokio::test]
async fn test_generate_expires_overdue_code_before_issuing() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 1).await;

    let mut code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    code.expires_at = Utc::now() - Duration::seconds(1);
    assert!(app.repo().update_code(&code).await.unwrap());

    let fresh = app.generate(entry.id, 24).await;
    assert_ne!(fresh.code_id, generated.code_id);

    let old = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(old.status, CodeStatus::Expired);
}

#[tokio::test]
async fn test_generate_with_email_delivery() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;

    let generated = app
        .state
        .engine
        .generate(
            GenerateRequest {
                whitelist_id: entry.id,
                ttl_hours: Some(24),
                send_email: true,
                custom_message: Some("Welcome aboard".to_string()),
            },
            &admin_context(),
        )
        .await
        .unwrap();
    assert_eq!(generated.email_sent, Some(true));

    let sent = app.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "dana@example.com");
    assert_eq!(sent[0].code, *generated.code.expose_secret());
    assert_eq!(sent[0].custom_message.as_deref(), Some("Welcome aboard"));

    let (email_events, _) = app
        .repo()
        .query(&AuditFilter {
            event_type: Some(AuditEventType::EmailSent),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(email_events.len(), 1);
    assert!(email_events[0].success);
}

#[tokio::test]
async fn test_failed_delivery_still_issues_code() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    app.mailer.set_failing(true);

    let generated = app
        .state
        .engine
        .generate(
            GenerateRequest {
                whitelist_id: entry.id,
                ttl_hours: Some(24),
                send_email: true,
                custom_message: None,
            },
            &admin_context(),
        )
        .await
        .unwrap();
    assert_eq!(generated.email_sent, Some(false));

    let (email_events, _) = app
        .repo()
        .query(&AuditFilter {
            event_type: Some(AuditEventType::EmailSent),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(email_events.len(), 1);
    assert!(!email_events[0].success);
}
