pub mod eta;
pub mod geo;
pub mod geofence;
pub mod location;
pub mod progress;
pub mod rate_limit;
pub mod tracking;
