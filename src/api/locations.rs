use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::{ApiResponse, AppError, AppState, ErrorResponse, SchoolId};
use crate::db;
use crate::models::{GeofenceEvent, HistoricalPosition, TripSnapshot, VehiclePosition};
use crate::services::geo;
use crate::services::tracking::LocationSubmission;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CaptureLocationRequest {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// GPS accuracy in meters; clamped to [1, 1000]
    pub accuracy: Option<f64>,
    /// Trip to evaluate geofences and progress against
    pub trip_id: Option<i64>,
    /// Submitting driver, rate limited independently of the vehicle
    pub driver_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CaptureLocationResponse {
    pub position: VehiclePosition,
    pub geofence_events: Vec<GeofenceEvent>,
    pub trip: Option<TripSnapshot>,
}

/// Submit a GPS sample for a vehicle
#[utoipa::path(
    post,
    path = "/api/locations",
    request_body = CaptureLocationRequest,
    responses(
        (status = 200, description = "Position captured", body = ApiResponse<CaptureLocationResponse>),
        (status = 400, description = "Invalid coordinates", body = ErrorResponse),
        (status = 401, description = "Missing tenant header", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse)
    ),
    tag = "locations"
)]
pub async fn capture_location(
    State(state): State<AppState>,
    SchoolId(school_id): SchoolId,
    Json(request): Json<CaptureLocationRequest>,
) -> Result<Json<ApiResponse<CaptureLocationResponse>>, AppError> {
    let outcome = state
        .pipeline
        .capture(
            &school_id,
            LocationSubmission {
                vehicle_id: request.vehicle_id,
                driver_id: request.driver_id,
                latitude: request.latitude,
                longitude: request.longitude,
                accuracy: request.accuracy,
                trip_id: request.trip_id,
            },
        )
        .await?;

    Ok(ApiResponse::ok(CaptureLocationResponse {
        position: outcome.position,
        geofence_events: outcome.geofence_events,
        trip: outcome.trip,
    }))
}

/// Current cached position of a vehicle
#[utoipa::path(
    get,
    path = "/api/locations/{vehicle_id}",
    params(("vehicle_id" = String, Path, description = "Vehicle identifier")),
    responses(
        (status = 200, description = "Current position", body = ApiResponse<VehiclePosition>),
        (status = 404, description = "No live position", body = ErrorResponse)
    ),
    tag = "locations"
)]
pub async fn get_current_location(
    State(state): State<AppState>,
    SchoolId(_school_id): SchoolId,
    Path(vehicle_id): Path<String>,
) -> Result<Json<ApiResponse<VehiclePosition>>, AppError> {
    state
        .pipeline
        .locations
        .current(&vehicle_id)
        .map(ApiResponse::ok)
        .ok_or_else(|| AppError::NotFound(format!("no live position for vehicle {vehicle_id}")))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// RFC 3339; defaults to 24 hours ago
    pub start_time: Option<DateTime<Utc>>,
    /// RFC 3339; defaults to now
    pub end_time: Option<DateTime<Utc>>,
    /// Clamped to [1, 1000]; defaults to 100
    pub limit: Option<i64>,
}

/// Durable position history for a vehicle
#[utoipa::path(
    get,
    path = "/api/locations/{vehicle_id}/history",
    params(
        ("vehicle_id" = String, Path, description = "Vehicle identifier"),
        HistoryQuery
    ),
    responses(
        (status = 200, description = "Position history, oldest first", body = ApiResponse<Vec<HistoricalPosition>>),
        (status = 400, description = "Invalid time range", body = ErrorResponse)
    ),
    tag = "locations"
)]
pub async fn get_location_history(
    State(state): State<AppState>,
    SchoolId(_school_id): SchoolId,
    Path(vehicle_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<HistoricalPosition>>>, AppError> {
    let end = query.end_time.unwrap_or_else(Utc::now);
    let start = query.start_time.unwrap_or(end - TimeDelta::hours(24));
    if start > end {
        return Err(AppError::Validation(
            "start_time must not be after end_time".to_string(),
        ));
    }
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);

    let rows = db::query_position_history(&state.pool, &vehicle_id, start, end, limit).await?;
    Ok(ApiResponse::ok(
        rows.into_iter().map(db::HistoryRow::into_position).collect(),
    ))
}

/// Every vehicle with a live cached position
#[utoipa::path(
    get,
    path = "/api/locations/active",
    responses(
        (status = 200, description = "Live positions", body = ApiResponse<Vec<VehiclePosition>>)
    ),
    tag = "locations"
)]
pub async fn list_active_vehicles(
    State(state): State<AppState>,
    SchoolId(_school_id): SchoolId,
) -> Json<ApiResponse<Vec<VehiclePosition>>> {
    ApiResponse::ok(state.pipeline.locations.active_vehicles())
}

/// Explicitly mark a vehicle offline
#[utoipa::path(
    post,
    path = "/api/locations/{vehicle_id}/offline",
    params(("vehicle_id" = String, Path, description = "Vehicle identifier")),
    responses(
        (status = 200, description = "Vehicle marked offline", body = ApiResponse<VehiclePosition>),
        (status = 404, description = "No live position", body = ErrorResponse)
    ),
    tag = "locations"
)]
pub async fn mark_vehicle_offline(
    State(state): State<AppState>,
    SchoolId(_school_id): SchoolId,
    Path(vehicle_id): Path<String>,
) -> Result<Json<ApiResponse<VehiclePosition>>, AppError> {
    state
        .pipeline
        .locations
        .mark_offline(&vehicle_id)
        .map(ApiResponse::ok)
        .ok_or_else(|| AppError::NotFound(format!("no live position for vehicle {vehicle_id}")))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DistanceQuery {
    pub from_lat: f64,
    pub from_lon: f64,
    pub to_lat: f64,
    pub to_lon: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DistanceResponse {
    pub distance_m: f64,
    pub distance_km: f64,
}

/// Great-circle distance between two points
#[utoipa::path(
    get,
    path = "/api/distance",
    params(DistanceQuery),
    responses(
        (status = 200, description = "Haversine distance", body = ApiResponse<DistanceResponse>),
        (status = 400, description = "Invalid coordinates", body = ErrorResponse)
    ),
    tag = "locations"
)]
pub async fn get_distance(
    SchoolId(_school_id): SchoolId,
    Query(query): Query<DistanceQuery>,
) -> Result<Json<ApiResponse<DistanceResponse>>, AppError> {
    geo::validate_coordinates(query.from_lat, query.from_lon)
        .and_then(|()| geo::validate_coordinates(query.to_lat, query.to_lon))
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let distance_m =
        geo::haversine_distance_m(query.from_lat, query.from_lon, query.to_lat, query.to_lon);
    Ok(ApiResponse::ok(DistanceResponse {
        distance_m,
        distance_km: distance_m / 1000.0,
    }))
}
