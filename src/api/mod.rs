pub mod eta;
pub mod locations;
pub mod speed;
pub mod trips;
pub mod ws;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

use crate::events::EventPublisher;
use crate::services::rate_limit::RateLimitDecision;
use crate::services::tracking::{CaptureError, TrackingPipeline};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub pipeline: TrackingPipeline,
    pub publisher: EventPublisher,
}

/// Success envelope: every endpoint answers `{ success, data }`
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Failure envelope: `{ success: false, error }` plus retry metadata on 429
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            retry_after_secs: None,
            reset_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("missing x-school-id header")]
    MissingTenant,
    #[error("{0}")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited(RateLimitDecision),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Location(e) => AppError::Validation(e.to_string()),
            CaptureError::RateLimited(decision) => AppError::RateLimited(decision),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Validation(message) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new(message))
            }
            AppError::MissingTenant => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("missing x-school-id header"),
            ),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, ErrorResponse::new(message)),
            AppError::RateLimited(decision) => {
                let now = chrono::Utc::now();
                let retry_after = (decision.reset_at - now).num_seconds().max(0);
                let mut body = ErrorResponse::new("rate limit exceeded");
                body.retry_after_secs = Some(retry_after);
                body.reset_at = Some(decision.reset_at.to_rfc3339());
                (StatusCode::TOO_MANY_REQUESTS, body)
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal error"),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Tenant context extracted from the `x-school-id` header; absent ⇒ 401
///
/// Trip and route lookups are filtered by this id. Vehicle-keyed reads
/// (live position, history, speed profile) are not: vehicles carry no
/// school column in this slice of the schema, so on those routes the
/// header establishes the caller's context without scoping the data.
#[derive(Debug, Clone)]
pub struct SchoolId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for SchoolId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-school-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| SchoolId(v.to_string()))
            .ok_or(AppError::MissingTenant)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/locations", post(locations::capture_location))
        .route("/locations/active", get(locations::list_active_vehicles))
        .route("/locations/{vehicle_id}", get(locations::get_current_location))
        .route(
            "/locations/{vehicle_id}/history",
            get(locations::get_location_history),
        )
        .route(
            "/locations/{vehicle_id}/offline",
            post(locations::mark_vehicle_offline),
        )
        .route("/distance", get(locations::get_distance))
        .route("/trips/{trip_id}/progress", get(trips::get_trip_progress))
        .route("/trips/{trip_id}/eta", get(eta::get_route_eta))
        .route("/trips/{trip_id}/eta/{stop_id}", get(eta::get_stop_eta))
        .route("/speed", post(speed::record_speed_reading))
        .route(
            "/speed/{vehicle_id}/{trip_id}/profile",
            get(speed::get_speed_profile),
        )
        .route("/ws", get(ws::ws_tracking))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeDelta, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::TrackingConfig;
    use crate::db;
    use crate::models::{HistoricalPosition, VehicleStatus};
    use crate::services::eta::EtaEstimator;
    use crate::services::geofence::{spawn_boarding_worker, GeofenceDetector};
    use crate::services::location::LocationService;
    use crate::services::progress::TripProgressTracker;
    use crate::services::rate_limit::RateLimiter;
    use crate::services::tracking::TrackingPipeline;
    use crate::store::TtlCache;

    const SCHOOL: &str = "school-1";

    async fn app() -> (Router, SqlitePool) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let cache = TtlCache::new();
        let config = TrackingConfig::default();
        let publisher = EventPublisher::new(64);
        let boarding_tx = spawn_boarding_worker(pool.clone(), cache.clone());

        let pipeline = TrackingPipeline::new(
            pool.clone(),
            config.clone(),
            RateLimiter::new(cache.clone()),
            LocationService::new(cache.clone(), pool.clone(), publisher.clone(), config.clone()),
            GeofenceDetector::new(cache.clone(), config.clone(), boarding_tx),
            TripProgressTracker::new(cache.clone(), pool.clone(), publisher.clone(), config.clone()),
            EtaEstimator::new(cache.clone(), pool.clone(), config),
            publisher.clone(),
        );
        let state = AppState {
            pool: pool.clone(),
            pipeline,
            publisher,
        };
        (router(state), pool)
    }

    fn capture_request(vehicle_id: &str) -> Request<Body> {
        let body = serde_json::json!({
            "vehicle_id": vehicle_id,
            "latitude": 48.137,
            "longitude": 11.575,
        });
        Request::builder()
            .method("POST")
            .uri("/locations")
            .header("content-type", "application/json")
            .header("x-school-id", SCHOOL)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_tenant_header_is_rejected_with_envelope() {
        let (app, _pool) = app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/locations/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["success"], serde_json::json!(false));
        assert!(body["error"].as_str().unwrap().contains("x-school-id"));
    }

    #[tokio::test]
    async fn eleventh_capture_is_429_with_retry_metadata() {
        let (app, _pool) = app().await;

        for i in 0..10 {
            let response = app.clone().oneshot(capture_request("bus-1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "capture {i}");
        }

        let response = app.oneshot(capture_request("bus-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = body_json(response).await;
        assert_eq!(body["success"], serde_json::json!(false));
        assert!(body["retry_after_secs"].as_i64().unwrap() >= 0);
        assert!(body["reset_at"].is_string());
    }

    #[tokio::test]
    async fn bad_coordinates_are_400() {
        let (app, _pool) = app().await;

        let body = serde_json::json!({
            "vehicle_id": "bus-1",
            "latitude": 91.0,
            "longitude": 11.575,
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/locations")
                    .header("content-type", "application/json")
                    .header("x-school-id", SCHOOL)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    async fn seed_history(pool: &SqlitePool, vehicle_id: &str, rows: i64) {
        let now = Utc::now();
        for i in 0..rows {
            db::append_historical_position(
                pool,
                &HistoricalPosition {
                    vehicle_id: vehicle_id.to_string(),
                    latitude: 48.137,
                    longitude: 11.575,
                    accuracy_m: 10.0,
                    status: VehicleStatus::Online,
                    trip_id: None,
                    captured_at: now - TimeDelta::seconds(i),
                    stored_at: now,
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn history_limit_is_clamped_to_one_thousand() {
        let (app, pool) = app().await;
        seed_history(&pool, "bus-1", 1100).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/locations/bus-1/history?limit=5000")
                    .header("x-school-id", SCHOOL)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn inverted_history_range_is_400() {
        let (app, _pool) = app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(
                        "/locations/bus-1/history\
                         ?start_time=2026-08-25T12:00:00Z&end_time=2026-08-25T10:00:00Z",
                    )
                    .header("x-school-id", SCHOOL)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
