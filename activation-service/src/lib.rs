pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ActivationConfig;
use crate::services::{
    ActivationEngine, ActivationRepository, AuditRecorder, CodeHasher, CodeMailer,
    StatsAggregator, ValidationThrottle, WhitelistService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: ActivationConfig,
    pub engine: Arc<ActivationEngine>,
    pub whitelist: WhitelistService,
    pub stats: StatsAggregator,
    pub audit: AuditRecorder,
    pub repo: Arc<dyn ActivationRepository>,
    pub ip_rate_limiter: IpRateLimiter,
}

/// Wire services over a storage backend and mailer.
pub fn build_state<R>(
    config: ActivationConfig,
    store: Arc<R>,
    mailer: Arc<dyn CodeMailer>,
) -> anyhow::Result<AppState>
where
    R: ActivationRepository + 'static,
{
    let hasher = CodeHasher::new(config.hashing.clone())?;
    let audit = AuditRecorder::new(store.clone());
    let repo: Arc<dyn ActivationRepository> = store;
    let throttle = ValidationThrottle::new(&config.rate_limit);

    let engine = Arc::new(ActivationEngine::new(
        repo.clone(),
        hasher,
        audit.clone(),
        throttle,
        mailer,
        config.codes.clone(),
    ));

    let ip_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.global_ip_limit,
        config.rate_limit.global_ip_window_seconds,
    );

    Ok(AppState {
        whitelist: WhitelistService::new(repo.clone()),
        stats: StatsAggregator::new(repo.clone()),
        engine,
        audit,
        repo,
        ip_rate_limiter,
        config,
    })
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let admin_routes = Router::new()
        .route(
            "/admin/activation-codes/generate",
            post(handlers::generate_code),
        )
        .route("/admin/activation-codes", get(handlers::list_codes))
        .route("/admin/activation-codes/:id", get(handlers::get_code))
        .route(
            "/admin/activation-codes/:id/extend",
            post(handlers::extend_code),
        )
        .route(
            "/admin/activation-codes/:id/revoke",
            post(handlers::revoke_code),
        )
        .route(
            "/admin/activation-codes/:id/resend-email",
            post(handlers::resend_code),
        )
        .route("/admin/activation-audit", get(handlers::query_audit))
        .route(
            "/admin/activation-audit/stats",
            get(handlers::activation_stats),
        )
        .route(
            "/admin/whitelist",
            post(handlers::create_entry).get(handlers::list_entries),
        )
        .route(
            "/admin/whitelist/:id",
            get(handlers::get_entry)
                .patch(handlers::update_entry)
                .delete(handlers::delete_entry),
        );

    let ip_limiter = state.ip_rate_limiter.clone();
    let request_timeout = state.config.common.request_timeout();

    let allowed_origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/activation/validate", post(handlers::validate_code))
        .merge(admin_routes)
        .with_state(state)
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");

            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
            )
        }))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(REQUEST_ID_HEADER),
                    HeaderName::from_static(handlers::ACTOR_HEADER),
                ]),
        );

    Ok(app)
}

/// Service health check
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.repo.ping().await.map_err(|e| {
        tracing::error!(error = %e, "Storage health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "storage": format!("{:?}", state.config.storage.backend).to_lowercase(),
    })))
}
