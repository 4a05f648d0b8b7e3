pub mod api;
mod config;
mod db;
mod events;
mod models;
mod services;
mod store;

use std::time::Duration;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use events::EventPublisher;
use services::eta::EtaEstimator;
use services::geofence::{spawn_boarding_worker, GeofenceDetector};
use services::location::LocationService;
use services::progress::TripProgressTracker;
use services::rate_limit::RateLimiter;
use services::tracking::TrackingPipeline;
use store::TtlCache;

#[derive(OpenApi)]
#[openapi(
    info(title = "School Transport Tracking API", version = "0.1.0"),
    paths(
        api::locations::capture_location,
        api::locations::get_current_location,
        api::locations::get_location_history,
        api::locations::list_active_vehicles,
        api::locations::mark_vehicle_offline,
        api::locations::get_distance,
        api::trips::get_trip_progress,
        api::eta::get_route_eta,
        api::eta::get_stop_eta,
        api::speed::record_speed_reading,
        api::speed::get_speed_profile,
    ),
    components(schemas(
        api::ErrorResponse,
        api::locations::CaptureLocationRequest,
        api::locations::CaptureLocationResponse,
        api::locations::DistanceResponse,
        api::speed::SpeedReadingRequest,
        api::speed::SpeedReadingResponse,
        models::VehiclePosition,
        models::VehicleStatus,
        models::HistoricalPosition,
        models::GeofenceEvent,
        models::GeofenceAction,
        models::TripSnapshot,
        models::NextStop,
        models::StudentCounts,
        models::RouteBreakdown,
        models::SegmentEta,
        models::SpeedProfile,
        models::EtaEstimate,
        models::EstimationMethod,
    )),
    tags(
        (name = "locations", description = "Vehicle position capture and lookup"),
        (name = "trips", description = "Trip progress tracking"),
        (name = "eta", description = "Arrival estimation"),
        (name = "speed", description = "Speed telemetry")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(bind_addr = %config.bind_addr, "Loaded configuration");

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-school-id"),
            ])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Initialize SQLite database
    let pool = SqlitePool::connect(&config.database_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    let migrator = sqlx::migrate!("./migrations");
    tracing::info!(migrations = migrator.migrations.len(), "Found migrations");
    migrator
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Database migrations completed");

    // Wire the tracking pipeline around one shared TTL cache
    let cache = TtlCache::new();
    let publisher = EventPublisher::new(256);
    let tracking = config.tracking.clone();
    let boarding_tx = spawn_boarding_worker(pool.clone(), cache.clone());

    let locations = LocationService::new(
        cache.clone(),
        pool.clone(),
        publisher.clone(),
        tracking.clone(),
    );
    let pipeline = TrackingPipeline::new(
        pool.clone(),
        tracking.clone(),
        RateLimiter::new(cache.clone()),
        locations.clone(),
        GeofenceDetector::new(cache.clone(), tracking.clone(), boarding_tx),
        TripProgressTracker::new(
            cache.clone(),
            pool.clone(),
            publisher.clone(),
            tracking.clone(),
        ),
        EtaEstimator::new(cache.clone(), pool.clone(), tracking.clone()),
        publisher.clone(),
    );

    // One background sweep covers every vehicle's snapshot schedule and
    // keeps the cache map pruned of expired entries.
    let sweep_locations = locations.clone();
    let sweep_cache = cache.clone();
    let sweep_interval = Duration::from_secs(tracking.snapshot_sweep_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweep_locations.snapshot_sweep().await;
            if let Err(e) = sweep_cache.purge_expired() {
                tracing::warn!(error = %e, "Cache purge failed");
            }
        }
    });

    let state = api::AppState {
        pool: pool.clone(),
        pipeline,
        publisher,
    };

    // Build the app
    let app = Router::new()
        .route("/", get(root))
        .nest("/api", api::router(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listen address");

    tracing::info!("Server running on http://{}", config.bind_addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "School Transport Tracking API"
}
