//! Equipment lending server
//!
//! REST API over the borrow, claim and return pipelines.

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use equiplend_server::{
    api,
    config::{AppConfig, StorageBackend},
    repository::{memory::MemoryStore, Repository},
    services::{
        anomaly::{AnomalyScorer, HttpAnomalyScorer},
        clock::SystemClock,
        events::{EventBus, LogNotifier, Notifier},
        redis::RedisNotifier,
        Services,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("equiplend_server={},tower_http=debug", config.logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting equipment lending server v{}", env!("CARGO_PKG_VERSION"));

    let repository = match config.database.backend {
        StorageBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .min_connections(config.database.min_connections)
                .connect(&config.database.url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Connected to database");

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;

            tracing::info!("Database migrations completed");
            Repository::postgres(pool)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, data is lost on restart");
            Repository::memory(Arc::new(MemoryStore::new()))
        }
    };

    let notifier: Arc<dyn Notifier> = if config.redis.url.is_empty() {
        tracing::info!("Redis not configured, events are only logged");
        Arc::new(LogNotifier)
    } else {
        let notifier = RedisNotifier::new(&config.redis.url)
            .await
            .context("Failed to connect to Redis")?;
        tracing::info!("Connected to Redis");
        Arc::new(notifier)
    };
    let events = EventBus::new(notifier, config.redis.channel.clone());

    let scorer: Option<Arc<dyn AnomalyScorer>> = if config.anomaly.enabled {
        let scorer = HttpAnomalyScorer::new(&config.anomaly).context("Failed to create anomaly scorer")?;
        tracing::info!(url = %config.anomaly.url, "Anomaly scoring enabled");
        Some(Arc::new(scorer))
    } else {
        None
    };

    let services = Services::new(
        repository.clone(),
        &config.lending,
        events,
        scorer,
        Arc::new(SystemClock),
    );

    let cancel = CancellationToken::new();
    let sweeper = services.sweeper.clone().spawn(cancel.clone());

    let addr = SocketAddr::new(
        config.server.host.parse().context("Invalid host address")?,
        config.server.port,
    );

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
        repository,
    };

    let app = create_router(state);

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!("Expiration sweeper ended abnormally: {}", e);
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Create the application router with all routes
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // API v1 routes
    let api_v1 = Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        .route("/ready", get(api::health::readiness_check))
        // Equipment
        .route(
            "/equipment",
            get(api::equipment::list_equipment).post(api::equipment::create_equipment),
        )
        .route("/equipment-names", get(api::equipment::list_equipment_names))
        .route(
            "/equipment/:id",
            get(api::equipment::get_equipment_type).patch(api::equipment::update_equipment_type),
        )
        .route("/equipment/:id/availability", get(api::equipment::get_availability))
        .route("/units/:id", get(api::equipment::get_unit_status))
        // Borrow requests
        .route(
            "/borrow-requests",
            get(api::borrow::list_pending_borrow_requests).post(api::borrow::create_borrow_request),
        )
        .route("/borrow-requests/:id", get(api::borrow::get_borrow_request))
        .route("/borrow-requests/:id/review", post(api::borrow::review_borrow_request))
        .route("/borrow-requests/:id/receive", post(api::borrow::receive_borrow_request))
        .route("/borrow-requests/:id/claim-code", get(api::borrow::get_claim_code))
        .route(
            "/borrow-requests/:id/status",
            axum::routing::patch(api::borrow::update_borrow_status),
        )
        .route("/borrow-history", get(api::borrow::get_borrow_history))
        .route("/borrowed-items", get(api::borrow::get_borrowed_items))
        // Return requests
        .route(
            "/return-requests",
            get(api::returns::list_return_requests).post(api::returns::create_return_request),
        )
        .route("/return-requests/:id", get(api::returns::get_return_request))
        .route("/return-requests/:id/confirm", post(api::returns::confirm_return_request))
        .route("/return-requests/:id/code", get(api::returns::get_return_code))
        .with_state(state);

    // OpenAPI documentation
    let openapi = api::openapi::create_openapi_router();

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(openapi)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}
