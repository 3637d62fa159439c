mod common;

use activation_service::models::{AuditEventType, CodeStatus, FailureReason, RequestContext};
use activation_service::services::{AuditFilter, Page, ValidateRequest, ValidationOutcome};
use common::{TestApp, WRONG_CODE};
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};

fn spawn_validations(
    app: &TestApp,
    code: &str,
    identifier: &str,
    count: usize,
) -> Vec<tokio::task::JoinHandle<ValidationOutcome>> {
    (0..count)
        .map(|i| {
            let engine = app.state.engine.clone();
            let code = code.to_string();
            let identifier = identifier.to_string();
            tokio::spawn(async move {
                engine
                    .validate(ValidateRequest {
                        code: SecretString::new(code),
                        identifier,
                        context: RequestContext::with_ip(format!("203.0.113.{}", i % 250)),
                    })
                    .await
                    .expect("validation errored")
            })
        })
        .collect()
}

async fn count_events(app: &TestApp, event_type: AuditEventType) -> u64 {
    let (_, total) = app
        .repo()
        .query(&AuditFilter {
            event_type: Some(event_type),
            page: Page::new(Some(1), Some(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    total
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_wrong_guesses_lock_exactly_once() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;

    let outcomes: Vec<ValidationOutcome> = join_all(spawn_validations(
        &app,
        WRONG_CODE,
        "dana@example.com",
        20,
    ))
    .await
    .into_iter()
    .map(|joined| joined.unwrap())
    .collect();

    let mut mismatches = 0;
    let mut locked = 0;
    for outcome in &outcomes {
        match outcome {
            ValidationOutcome::Failure(f) if f.reason == FailureReason::InvalidCode => mismatches += 1,
            ValidationOutcome::Failure(f) if f.reason == FailureReason::Locked => locked += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    // Every counted guess is one increment; the rest found the code already locked.
    assert_eq!(mismatches, 5);
    assert_eq!(locked, 15);

    let code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(code.failed_attempts, 5);
    assert_eq!(code.status, CodeStatus::Locked);

    assert_eq!(count_events(&app, AuditEventType::CodeLocked).await, 1);
    assert_eq!(count_events(&app, AuditEventType::ActivationFailed).await, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_correct_guesses_activate_once() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 24).await;

    let outcomes: Vec<ValidationOutcome> = join_all(spawn_validations(
        &app,
        generated.code.expose_secret(),
        "dana@example.com",
        8,
    ))
    .await
    .into_iter()
    .map(|joined| joined.unwrap())
    .collect();

    let winners: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            ValidationOutcome::Success(grant) => Some(grant),
            ValidationOutcome::Failure(_) => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);

    for outcome in &outcomes {
        if let ValidationOutcome::Failure(f) = outcome {
            assert_eq!(f.reason, FailureReason::AlreadyUsed);
        }
    }

    let stored = app.repo().find_entry(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.activated_user_id, Some(winners[0].user_id));
    assert_eq!(count_events(&app, AuditEventType::ActivationSuccess).await, 1);

    let code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    assert_eq!(code.failed_attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_sweeps_expire_once() {
    let app = TestApp::spawn().await;
    let entry = app.create_entry("dana@example.com").await;
    let generated = app.generate(entry.id, 1).await;

    let mut code = app.repo().find_code(generated.code_id).await.unwrap().unwrap();
    code.expires_at = chrono::Utc::now() - chrono::Duration::minutes(5);
    assert!(app.repo().update_code(&code).await.unwrap());

    let sweeps = (0..4).map(|_| {
        let engine = app.state.engine.clone();
        tokio::spawn(async move { engine.sweep_expired().await.unwrap() })
    });
    let expired: u64 = join_all(sweeps)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .sum();

    assert_eq!(expired, 1);
    assert_eq!(count_events(&app, AuditEventType::CodeExpired).await, 1);
}
