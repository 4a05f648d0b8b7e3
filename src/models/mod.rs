pub mod eta;
pub mod position;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use eta::{EstimationMethod, EtaEstimate, RouteBreakdown, SegmentEta, SpeedProfile};
pub use position::{HistoricalPosition, SpeedSample, VehiclePosition, VehicleStatus};

/// Proximity band of a vehicle relative to a stop's geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceZone {
    Outside,
    Approaching,
    Arrived,
}

/// Transition fired when a vehicle crosses a geofence boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceAction {
    Approaching,
    Arrived,
    Departed,
}

/// A geofence transition for one (vehicle, stop) pair
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GeofenceEvent {
    pub stop_id: i64,
    pub stop_name: Option<String>,
    pub action: GeofenceAction,
    /// Distance to the stop when the transition fired, in meters
    pub distance_m: f64,
    pub timestamp: DateTime<Utc>,
}

/// One stop on a route, in visiting order
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteStop {
    pub stop_id: i64,
    pub stop_name: Option<String>,
    pub sequence: i64,
    pub lat: f64,
    pub lon: f64,
    /// Planned dwell time at this stop in seconds
    pub wait_secs: i64,
}

/// Per-trip student boarding/alighting tallies
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct StudentCounts {
    pub boarded: i64,
    pub alighted: i64,
    pub absent: i64,
    /// Total students expected on this trip
    pub expected: i64,
}

/// The next stop a vehicle is heading to, with a coarse arrival estimate
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NextStop {
    pub stop_id: i64,
    pub stop_name: Option<String>,
    pub sequence: i64,
    pub lat: f64,
    pub lon: f64,
    /// Distance from the vehicle's current position, in km
    pub distance_km: f64,
    /// Flat-speed arrival estimate in seconds
    pub eta_secs: i64,
}

/// Derived view of a trip's progress; cached briefly, never stored durably
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TripSnapshot {
    pub trip_id: i64,
    pub route_id: i64,
    pub vehicle_id: String,
    pub total_stops: usize,
    /// Distinct stops with at least one recorded alighting
    pub completed_stops: usize,
    pub current_stop_index: usize,
    /// Absent once every stop is completed
    pub next_stop: Option<NextStop>,
    /// completed / total, rounded to whole percent
    pub progress_percentage: u8,
    pub students: StudentCounts,
    pub updated_at: DateTime<Utc>,
}
