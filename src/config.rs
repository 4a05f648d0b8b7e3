use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// SQLite connection string
    #[serde(default = "Config::default_database_url")]
    pub database_url: String,
    /// Listen address
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    /// Vehicle tracking configuration
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Configuration for the live tracking pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// TTL in seconds for a cached vehicle position (default: 60).
    /// A vehicle whose position is not refreshed within this window
    /// becomes "unknown", not merely offline.
    #[serde(default = "TrackingConfig::default_location_ttl_secs")]
    pub location_ttl_secs: u64,
    /// Minimum seconds between durable position snapshots per vehicle
    /// (default: 300)
    #[serde(default = "TrackingConfig::default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Cadence of the background snapshot sweep in seconds (default: 60)
    #[serde(default = "TrackingConfig::default_snapshot_sweep_secs")]
    pub snapshot_sweep_secs: u64,
    /// Per-vehicle submission cap
    #[serde(default = "TrackingConfig::default_vehicle_rate_limit")]
    pub vehicle_rate_limit: RateLimitRule,
    /// Per-driver submission cap
    #[serde(default = "TrackingConfig::default_driver_rate_limit")]
    pub driver_rate_limit: RateLimitRule,
    /// Distance in meters at which a vehicle counts as approaching a stop
    /// (default: 500)
    #[serde(default = "TrackingConfig::default_approach_radius_m")]
    pub approach_radius_m: f64,
    /// Distance in meters at which a vehicle counts as arrived at a stop
    /// (default: 100)
    #[serde(default = "TrackingConfig::default_arrival_radius_m")]
    pub arrival_radius_m: f64,
    /// Reserved departure hysteresis radius (default: 150). Departure is
    /// currently detected on the arrived->outside transition of the same
    /// three-band classifier, so this knob is accepted but not read.
    #[serde(default = "TrackingConfig::default_departure_radius_m")]
    pub departure_radius_m: f64,
    /// Cap on the per-(vehicle, trip) speed sample ring buffer (default: 60)
    #[serde(default = "TrackingConfig::default_speed_buffer_len")]
    pub speed_buffer_len: usize,
    /// TTL in seconds for a trip's speed buffer (default: 21600). Eviction
    /// is by length; this only bounds buffers of abandoned trips.
    #[serde(default = "TrackingConfig::default_speed_buffer_ttl_secs")]
    pub speed_buffer_ttl_secs: u64,
    /// Speed in km/h assumed when no usable speed data exists (default: 40)
    #[serde(default = "TrackingConfig::default_fallback_speed_kmh")]
    pub fallback_speed_kmh: f64,
    /// TTL in seconds for cached trip progress snapshots (default: 60)
    #[serde(default = "TrackingConfig::default_progress_cache_ttl_secs")]
    pub progress_cache_ttl_secs: u64,
}

/// A sliding-window submission cap
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitRule {
    pub max_updates: usize,
    pub window_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            location_ttl_secs: Self::default_location_ttl_secs(),
            snapshot_interval_secs: Self::default_snapshot_interval_secs(),
            snapshot_sweep_secs: Self::default_snapshot_sweep_secs(),
            vehicle_rate_limit: Self::default_vehicle_rate_limit(),
            driver_rate_limit: Self::default_driver_rate_limit(),
            approach_radius_m: Self::default_approach_radius_m(),
            arrival_radius_m: Self::default_arrival_radius_m(),
            departure_radius_m: Self::default_departure_radius_m(),
            speed_buffer_len: Self::default_speed_buffer_len(),
            speed_buffer_ttl_secs: Self::default_speed_buffer_ttl_secs(),
            fallback_speed_kmh: Self::default_fallback_speed_kmh(),
            progress_cache_ttl_secs: Self::default_progress_cache_ttl_secs(),
        }
    }
}

impl TrackingConfig {
    fn default_location_ttl_secs() -> u64 {
        60
    }
    fn default_snapshot_interval_secs() -> u64 {
        300
    }
    fn default_snapshot_sweep_secs() -> u64 {
        60
    }
    fn default_vehicle_rate_limit() -> RateLimitRule {
        RateLimitRule {
            max_updates: 10,
            window_secs: 60,
        }
    }
    fn default_driver_rate_limit() -> RateLimitRule {
        RateLimitRule {
            max_updates: 20,
            window_secs: 60,
        }
    }
    fn default_approach_radius_m() -> f64 {
        500.0
    }
    fn default_arrival_radius_m() -> f64 {
        100.0
    }
    fn default_departure_radius_m() -> f64 {
        150.0
    }
    fn default_speed_buffer_len() -> usize {
        60
    }
    fn default_speed_buffer_ttl_secs() -> u64 {
        21_600
    }
    fn default_fallback_speed_kmh() -> f64 {
        40.0
    }
    fn default_progress_cache_ttl_secs() -> u64 {
        60
    }
}

impl Config {
    fn default_database_url() -> String {
        "sqlite:database/tracking.db?mode=rwc".to_string()
    }

    fn default_bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
