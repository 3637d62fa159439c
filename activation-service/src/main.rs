use activation_service::{
    build_router, build_state,
    config::{ActivationConfig, StorageBackend},
    db,
    services::{metrics, CodeMailer, LogMailer, MemoryStore, PgStore, SmtpMailer},
    AppState,
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::prune;
use service_core::observability::init_tracing;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = ActivationConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    metrics::init_metrics()?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        storage = ?config.storage.backend,
        "Starting activation service"
    );

    let mailer: Arc<dyn CodeMailer> = match &config.smtp {
        Some(smtp) => {
            tracing::info!(host = %smtp.host, "SMTP mailer initialized");
            Arc::new(SmtpMailer::new(smtp)?)
        }
        None => {
            tracing::warn!("SMTP not configured; activation emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    let state: AppState = match config.storage.backend {
        StorageBackend::Postgres => {
            let pool = db::create_pool(&config.storage).await?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            build_state(config.clone(), Arc::new(PgStore::new(pool)), mailer)?
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; all data is lost on restart");
            build_state(config.clone(), Arc::new(MemoryStore::new()), mailer)?
        }
    };

    let sweeper = state
        .engine
        .clone()
        .spawn_expiry_sweeper(Duration::from_secs(config.expiry_sweep_interval_seconds));
    tracing::info!(
        interval_seconds = config.expiry_sweep_interval_seconds,
        "Expiry sweeper started"
    );

    let ip_limiter = state.ip_rate_limiter.clone();
    let prune_every = Duration::from_secs(config.expiry_sweep_interval_seconds);
    let limiter_pruner = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(prune_every);
        loop {
            ticker.tick().await;
            let tracked = prune(&ip_limiter);
            tracing::debug!(tracked, "Pruned global IP rate limiter");
        }
    });

    let app = build_router(state).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // In-flight requests get `shutdown_grace_seconds` to drain once a signal arrives.
    let grace = Duration::from_secs(config.common.shutdown_grace_seconds);
    let (draining_tx, mut draining_rx) = tokio::sync::watch::channel(false);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = draining_tx.send(true);
    })
    .into_future();

    let grace_elapsed = async move {
        if draining_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result?,
        _ = grace_elapsed => {
            tracing::warn!(grace_seconds = grace.as_secs(), "Shutdown grace period elapsed; dropping in-flight requests");
        }
    }

    sweeper.abort();
    limiter_pruner.abort();
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
}
