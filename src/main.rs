mod app_state;
mod config;
mod db;
mod error;
mod models;
mod resilience;
mod routes;
mod services;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use resilience::{BoundedCache, ExecutorConfig, RateLimiter, ResilientExecutor};
use services::{
    recognition::RecognitionClient, storage::ObjectStore, trigger::TriggerDispatcher,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing plate-intake server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "ingest_files_accepted_total",
        "Uploaded files stored and enqueued as work items"
    );
    metrics::describe_counter!(
        "ingest_files_rejected_total",
        "Uploaded files rejected by validation or upload failure"
    );
    metrics::describe_counter!(
        "work_items_completed_total",
        "Work items that reached the done state"
    );
    metrics::describe_counter!(
        "work_items_failed_total",
        "Work items that reached the error state"
    );
    metrics::describe_counter!(
        "executor_circuit_opened_total",
        "Circuit breaker open transitions across all operation keys"
    );
    metrics::describe_gauge!(
        "work_items_pending",
        "Current number of pending work items"
    );
    metrics::describe_histogram!(
        "recognition_seconds",
        "Latency of recognition-service calls per item"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize object storage client
    tracing::info!("Initializing object storage client");
    let storage = ObjectStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
        &config.s3_public_base_url,
    )
    .expect("Failed to initialize object storage client");

    // Initialize recognition service client
    tracing::info!("Initializing recognition service client");
    let recognizer = RecognitionClient::new(&config.recognition_url, &config.recognition_token)
        .expect("Failed to initialize recognition client");

    // Resilience primitives shared across handlers
    let executor = Arc::new(ResilientExecutor::new(ExecutorConfig::default()));
    let rate_limiter = RateLimiter::new(
        config.rate_limit_max,
        Duration::from_secs(config.rate_limit_window_secs),
    );
    let validation_cache = BoundedCache::new(1024);

    let trigger = TriggerDispatcher::new(
        executor.clone(),
        config.process_function_url.clone(),
        &config.environment,
        config.local_port(),
    );

    // Create shared application state
    let state = AppState::new(
        db_pool,
        storage,
        recognizer,
        executor,
        rate_limiter,
        validation_cache,
        trigger,
    );

    // Periodic sweep keeps rate-limiter memory bounded.
    {
        let limiter = state.rate_limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                limiter.prune_idle();
            }
        });
    }

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/photos", post(routes::upload::upload_batch))
        .route("/api/v1/photos/{id}", get(routes::items::get_item))
        .route("/api/v1/photos/{id}/retry", post(routes::items::retry_item))
        .route("/api/v1/process", get(routes::process::run_processing))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(55 * 1024 * 1024)); // batch bound + multipart overhead

    tracing::info!("Starting plate-intake on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
