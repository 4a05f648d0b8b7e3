use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use super::trips::resolve_position;
use super::{ApiResponse, AppError, AppState, ErrorResponse, SchoolId};
use crate::db;
use crate::models::{RouteBreakdown, RouteStop, SegmentEta};

#[derive(Debug, Deserialize, IntoParams)]
pub struct EtaQuery {
    /// Vehicle latitude; defaults to the cached live position
    pub lat: Option<f64>,
    /// Vehicle longitude; defaults to the cached live position
    pub lon: Option<f64>,
    /// Current speed in km/h; 0 falls back to estimation from history
    pub speed_kmh: Option<f64>,
}

/// Remaining stops on a trip's route, from the first uncompleted one.
async fn remaining_stops(
    state: &AppState,
    trip_id: i64,
    route_id: i64,
) -> Result<Vec<RouteStop>, AppError> {
    let stops = db::find_route_stops(&state.pool, route_id).await?;
    let completed = db::count_alighted_stops(&state.pool, trip_id).await? as usize;
    Ok(stops.into_iter().skip(completed).collect())
}

/// Per-stop arrival estimates for the remainder of a trip
#[utoipa::path(
    get,
    path = "/api/trips/{trip_id}/eta",
    params(("trip_id" = i64, Path, description = "Trip identifier"), EtaQuery),
    responses(
        (status = 200, description = "Route ETA breakdown (up to 5 stops)", body = ApiResponse<RouteBreakdown>),
        (status = 404, description = "Unknown trip or no live position", body = ErrorResponse)
    ),
    tag = "eta"
)]
pub async fn get_route_eta(
    State(state): State<AppState>,
    SchoolId(school_id): SchoolId,
    Path(trip_id): Path<i64>,
    Query(query): Query<EtaQuery>,
) -> Result<Json<ApiResponse<RouteBreakdown>>, AppError> {
    let trip = db::find_trip(&state.pool, trip_id, &school_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))?;

    let current = resolve_position(&state, &school_id, trip_id, query.lat, query.lon).await?;
    let stops = remaining_stops(&state, trip_id, trip.route_id).await?;
    let speed = query.speed_kmh.unwrap_or(0.0);

    let breakdown = state
        .pipeline
        .estimator
        .estimate_route_breakdown(trip_id, &trip.vehicle_id, current, speed, &stops)
        .await;

    Ok(ApiResponse::ok(breakdown))
}

/// Arrival estimate for one specific stop on a trip
#[utoipa::path(
    get,
    path = "/api/trips/{trip_id}/eta/{stop_id}",
    params(
        ("trip_id" = i64, Path, description = "Trip identifier"),
        ("stop_id" = i64, Path, description = "Route stop identifier"),
        EtaQuery
    ),
    responses(
        (status = 200, description = "ETA for the stop", body = ApiResponse<SegmentEta>),
        (status = 404, description = "Stop not on this trip's route", body = ErrorResponse)
    ),
    tag = "eta"
)]
pub async fn get_stop_eta(
    State(state): State<AppState>,
    SchoolId(school_id): SchoolId,
    Path((trip_id, stop_id)): Path<(i64, i64)>,
    Query(query): Query<EtaQuery>,
) -> Result<Json<ApiResponse<SegmentEta>>, AppError> {
    let trip = db::find_trip(&state.pool, trip_id, &school_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("trip {trip_id} not found")))?;

    let current = resolve_position(&state, &school_id, trip_id, query.lat, query.lon).await?;
    let stops = remaining_stops(&state, trip_id, trip.route_id).await?;
    let speed = query.speed_kmh.unwrap_or(0.0);

    let breakdown = state
        .pipeline
        .estimator
        .estimate_route_breakdown(trip_id, &trip.vehicle_id, current, speed, &stops)
        .await;

    if let Some(segment) = breakdown.segments.into_iter().find(|s| s.stop_id == stop_id) {
        return Ok(ApiResponse::ok(segment));
    }

    // The stop is beyond the breakdown window (or already completed):
    // estimate the direct segment as long as it exists on the route.
    let all_stops = db::find_route_stops(&state.pool, trip.route_id).await?;
    let stop = all_stops
        .into_iter()
        .find(|s| s.stop_id == stop_id)
        .ok_or_else(|| {
            AppError::NotFound(format!("stop {stop_id} not on route of trip {trip_id}"))
        })?;

    let estimate = state
        .pipeline
        .estimator
        .estimate_segment(&trip.vehicle_id, Some(trip_id), current, (stop.lat, stop.lon), speed)
        .await;

    Ok(ApiResponse::ok(SegmentEta {
        stop_id: stop.stop_id,
        stop_name: stop.stop_name,
        sequence: stop.sequence,
        distance_km: estimate.distance_km,
        estimated_secs: estimate.estimated_secs,
        arrival_at: chrono::Utc::now() + chrono::TimeDelta::seconds(estimate.estimated_secs),
        confidence: estimate.confidence,
    }))
}
