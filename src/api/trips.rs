use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use super::{ApiResponse, AppError, AppState, ErrorResponse, SchoolId};
use crate::db;
use crate::models::TripSnapshot;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ProgressQuery {
    /// Vehicle latitude; defaults to the cached live position
    pub lat: Option<f64>,
    /// Vehicle longitude; defaults to the cached live position
    pub lon: Option<f64>,
}

/// Resolve the vehicle coordinates for a trip: explicit query parameters
/// win, otherwise fall back to the trip vehicle's cached position.
pub(super) async fn resolve_position(
    state: &AppState,
    school_id: &str,
    trip_id: i64,
    lat: Option<f64>,
    lon: Option<f64>,
) -> Result<(f64, f64), AppError> {
    if let (Some(lat), Some(lon)) = (lat, lon) {
        return Ok((lat, lon));
    }

    let trip = db::find_trip(&state.pool, trip_id, school_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))?;

    state
        .pipeline
        .locations
        .current(&trip.vehicle_id)
        .map(|p| (p.latitude, p.longitude))
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no live position for vehicle {} on trip {trip_id}",
                trip.vehicle_id
            ))
        })
}

/// Progress snapshot for a trip
#[utoipa::path(
    get,
    path = "/api/trips/{trip_id}/progress",
    params(("trip_id" = i64, Path, description = "Trip identifier"), ProgressQuery),
    responses(
        (status = 200, description = "Trip progress", body = ApiResponse<TripSnapshot>),
        (status = 404, description = "Unknown trip or no live position", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn get_trip_progress(
    State(state): State<AppState>,
    SchoolId(school_id): SchoolId,
    Path(trip_id): Path<i64>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ApiResponse<TripSnapshot>>, AppError> {
    let (lat, lon) = resolve_position(&state, &school_id, trip_id, query.lat, query.lon).await?;

    state
        .pipeline
        .progress
        .progress(trip_id, &school_id, lat, lon)
        .await?
        .map(ApiResponse::ok)
        .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))
}
