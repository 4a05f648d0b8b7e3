use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Reported operational status of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Online,
    Offline,
    Inactive,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Online => "online",
            VehicleStatus::Offline => "offline",
            VehicleStatus::Inactive => "inactive",
        }
    }

    /// Lenient parse for values coming back from the durable store
    pub fn parse(s: &str) -> Self {
        match s {
            "online" => VehicleStatus::Online,
            "offline" => VehicleStatus::Offline,
            _ => VehicleStatus::Inactive,
        }
    }
}

/// Most recent known position of a vehicle
///
/// Lives only in the ephemeral cache; expires after a short TTL so an
/// un-refreshed vehicle becomes "unknown" rather than stale. A durable
/// copy is appended on a fixed cadence, not on every sample.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// GPS accuracy in meters, clamped to [1, 1000]
    pub accuracy_m: f64,
    pub status: VehicleStatus,
    /// Trip this sample was submitted for, if any
    pub trip_id: Option<i64>,
    pub captured_at: DateTime<Utc>,
}

/// Durable copy of a position sample
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HistoricalPosition {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub status: VehicleStatus,
    pub trip_id: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

/// One entry in the bounded per-(vehicle, trip) speed buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct SpeedSample {
    pub captured_at: DateTime<Utc>,
    pub speed_kmh: f64,
    pub accuracy_m: f64,
}
