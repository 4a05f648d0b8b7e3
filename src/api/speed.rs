use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ApiResponse, AppError, AppState, ErrorResponse, SchoolId};
use crate::models::SpeedProfile;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SpeedReadingRequest {
    pub vehicle_id: String,
    pub trip_id: i64,
    pub speed_kmh: f64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SpeedReadingResponse {
    pub recorded: bool,
}

/// Record a speed reading into the trip's sample buffer
///
/// Best-effort telemetry: implausible readings are dropped silently and the
/// response is still a success.
#[utoipa::path(
    post,
    path = "/api/speed",
    request_body = SpeedReadingRequest,
    responses(
        (status = 200, description = "Reading accepted", body = ApiResponse<SpeedReadingResponse>),
        (status = 400, description = "Negative speed", body = ErrorResponse)
    ),
    tag = "speed"
)]
pub async fn record_speed_reading(
    State(state): State<AppState>,
    SchoolId(_school_id): SchoolId,
    Json(request): Json<SpeedReadingRequest>,
) -> Result<Json<ApiResponse<SpeedReadingResponse>>, AppError> {
    if request.speed_kmh < 0.0 {
        return Err(AppError::Validation("speed_kmh must be >= 0".to_string()));
    }

    state.pipeline.estimator.record_speed(
        &request.vehicle_id,
        request.trip_id,
        request.speed_kmh,
        request.accuracy,
    );

    Ok(ApiResponse::ok(SpeedReadingResponse { recorded: true }))
}

/// Speed statistics for a (vehicle, trip) pair
#[utoipa::path(
    get,
    path = "/api/speed/{vehicle_id}/{trip_id}/profile",
    params(
        ("vehicle_id" = String, Path, description = "Vehicle identifier"),
        ("trip_id" = i64, Path, description = "Trip identifier")
    ),
    responses(
        (status = 200, description = "Speed profile", body = ApiResponse<SpeedProfile>)
    ),
    tag = "speed"
)]
pub async fn get_speed_profile(
    State(state): State<AppState>,
    SchoolId(_school_id): SchoolId,
    Path((vehicle_id, trip_id)): Path<(String, i64)>,
) -> Json<ApiResponse<SpeedProfile>> {
    ApiResponse::ok(state.pipeline.estimator.speed_profile(&vehicle_id, trip_id))
}
