use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Which estimation strategy produced an ETA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMethod {
    /// Constant-speed fallback, always available
    Simple,
    /// Median speed over recent durable position pairs
    Historical,
    /// Acceleration-projected speed from the recent sample buffer
    Kalman,
    /// Confidence-weighted blend of the other methods
    Weighted,
}

/// Arrival estimate for a single segment
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EtaEstimate {
    pub distance_km: f64,
    pub estimated_secs: i64,
    /// Self-assessed trust in this estimate, in [0, 1]
    pub confidence: f64,
    pub method: EstimationMethod,
}

/// Arrival estimate for one remaining stop on a route
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SegmentEta {
    pub stop_id: i64,
    pub stop_name: Option<String>,
    pub sequence: i64,
    /// Length of this hop in km
    pub distance_km: f64,
    /// Seconds from now until arrival at this stop (cumulative)
    pub estimated_secs: i64,
    pub arrival_at: DateTime<Utc>,
    pub confidence: f64,
}

/// Speed statistics derived from the cached sample buffer
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SpeedProfile {
    pub current_kmh: f64,
    pub average_kmh: f64,
    pub max_kmh: f64,
    pub min_kmh: f64,
    pub sample_count: usize,
}

/// Per-stop arrival estimates for the remainder of a route
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteBreakdown {
    pub trip_id: i64,
    pub vehicle_id: String,
    pub segments: Vec<SegmentEta>,
    pub total_distance_km: f64,
    pub total_secs: i64,
    /// Mean of the segment confidences
    pub overall_confidence: f64,
    pub speed_profile: SpeedProfile,
    pub calculated_at: DateTime<Utc>,
}
