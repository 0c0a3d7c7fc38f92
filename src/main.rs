use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use matchpay::api::{self, ApiState};
use matchpay::cache::{init_cache_pool, CacheConfig, RedisCache};
use matchpay::config::AppConfig;
use matchpay::database::catalog_repository::PgPriceCatalog;
use matchpay::database::transaction_repository::PgTransactionStore;
use matchpay::database::{init_pool_from_config, run_migrations};
use matchpay::health::{HealthChecker, HealthState, HealthStatus};
use matchpay::logging::{init_tracing, mask_secret};
use matchpay::middleware::auth::JwtKeys;
use matchpay::middleware::logging::{request_logging_middleware, UuidRequestId};
use matchpay::payments::PaymentProviderFactory;
use matchpay::services::{PaymentsService, PricingService};
use matchpay::workers::status_reconciler::StatusReconcilerWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting matchpay backend service"
    );

    info!(
        host = %config.server.host,
        port = config.server.port,
        currency = %config.payments.currency,
        "Server configuration loaded"
    );

    // Database
    info!("📊 Initializing database connection pool...");
    let db_pool = init_pool_from_config(&config.database).await.map_err(|e| {
        error!("Failed to initialize database pool: {}", e);
        e
    })?;
    info!(
        max_connections = config.database.max_connections,
        "✅ Database connection pool initialized"
    );

    if config.database.run_migrations {
        info!("📜 Running database migrations...");
        run_migrations(&db_pool).await?;
        info!("✅ Database migrations applied");
    } else {
        info!("⏭️  Skipping database migrations (DB_RUN_MIGRATIONS=false)");
    }

    // Cache
    let cache_ttl = Duration::from_secs(config.cache.default_ttl);
    let redis_cache = match &config.cache.redis_url {
        Some(redis_url) => {
            info!("🔴 Initializing Redis cache...");
            let cache_config = CacheConfig::from_app(redis_url, config.cache.max_connections);
            match init_cache_pool(cache_config).await {
                Ok(pool) => {
                    info!("✅ Redis cache initialized");
                    Some(RedisCache::new(pool, cache_ttl))
                }
                Err(e) => {
                    warn!(error = %e, "⚠️  Redis unavailable, prices will be read from Postgres");
                    None
                }
            }
        }
        None => {
            info!("⏭️  REDIS_URL not set, price cache disabled");
            None
        }
    };

    // Payment providers
    if let (Some(base), Some(unitpay)) = (
        config.payments.result_base_url.as_deref(),
        config.payments.providers.unitpay.as_mut(),
    ) {
        if unitpay.result_url.is_none() {
            unitpay.result_url = Some(format!("{}/unitpay/result", base.trim_end_matches('/')));
        }
    }
    if let Some(robokassa) = &config.payments.providers.robokassa {
        info!(
            merchant_login = %mask_secret(&robokassa.merchant_login),
            test_mode = robokassa.test_mode,
            "💳 Robokassa driver configured"
        );
    }
    let providers = Arc::new(PaymentProviderFactory::from_config(
        config.payments.providers.clone(),
    )?);
    let provider_names: Vec<String> = providers
        .list_available_providers()
        .iter()
        .map(|p| p.to_string())
        .collect();

    // Services
    let mut pricing = PricingService::new(Arc::new(PgPriceCatalog::new(db_pool.clone())));
    if let Some(cache) = redis_cache.clone() {
        pricing = pricing.with_cache(cache, cache_ttl);
    }
    let payments = Arc::new(PaymentsService::new(
        Arc::new(PgTransactionStore::new(db_pool.clone())),
        Arc::new(pricing),
        providers,
        config.payments.currency.clone(),
    ));
    let jwt = JwtKeys::from_secret(&config.auth.jwt_secret)?;

    // Reconciler
    let reconciler = StatusReconcilerWorker::new(payments.clone(), config.reconciler.clone());
    if config.reconciler.run_once {
        info!("🔁 Running a single reconciliation cycle (RECONCILER_RUN_ONCE=true)");
        let report = reconciler.run_cycle().await?;
        info!(
            examined = report.examined,
            completed = report.completed,
            canceled = report.canceled,
            still_pending = report.still_pending,
            "✅ Reconciliation cycle finished"
        );
        return Ok(());
    }

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let reconciler_handle = if config.reconciler.enabled {
        info!("🔁 Starting payment status reconciler");
        Some(tokio::spawn(reconciler.run(worker_shutdown_rx)))
    } else {
        info!("⏭️  Payment status reconciler disabled (RECONCILER_ENABLED=false)");
        None
    };

    // Routes
    let health_checker = HealthChecker::new(db_pool, redis_cache, provider_names);
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .with_state(health_checker);

    let app = api::router(ApiState { payments, jwt })
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        );

    info!("✅ Routes configured");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = reconciler_handle {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for reconciler shutdown");
        }
    }

    info!("👋 Server shutdown complete");

    Ok(())
}

async fn health(
    State(checker): State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let health_status = checker.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("❌ Health check failed - service unhealthy");
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        Ok(Json(health_status))
    }
}

/// Readiness probe - database reachable, cache optional
async fn readiness(
    state: State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, String)> {
    let result = health(state).await;
    if result.is_err() {
        error!("❌ Readiness check failed");
    }
    result
}

/// Liveness probe
async fn liveness() -> &'static str {
    "OK"
}
