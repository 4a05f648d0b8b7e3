use thiserror::Error;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum CoordinateError {
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// Great-circle distance between two points in meters
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Great-circle distance between two points in kilometers
pub fn haversine_distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    haversine_distance_m(lat1, lon1, lat2, lon2) / 1000.0
}

pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), CoordinateError> {
    if !(-90.0..=90.0).contains(&lat) || !lat.is_finite() {
        return Err(CoordinateError::LatitudeOutOfRange(lat));
    }
    if !(-180.0..=180.0).contains(&lon) || !lon.is_finite() {
        return Err(CoordinateError::LongitudeOutOfRange(lon));
    }
    Ok(())
}

/// Clamp reported GPS accuracy to a sane band
pub fn clamp_accuracy_m(accuracy: Option<f64>) -> f64 {
    accuracy.unwrap_or(10.0).clamp(1.0, 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_matches_known_distance() {
        // Berlin Hbf to Munich Hbf, ~504 km
        let d = haversine_distance_km(52.5251, 13.3694, 48.1402, 11.5586);
        assert!((d - 504.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        assert_eq!(haversine_distance_m(48.0, 11.0, 48.0, 11.0), 0.0);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(-91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, 181.0).is_err());
        assert!(validate_coordinates(0.0, -181.0).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
        assert!(validate_coordinates(45.0, 90.0).is_ok());
    }

    #[test]
    fn accuracy_clamped_to_band() {
        assert_eq!(clamp_accuracy_m(Some(0.1)), 1.0);
        assert_eq!(clamp_accuracy_m(Some(5000.0)), 1000.0);
        assert_eq!(clamp_accuracy_m(Some(12.0)), 12.0);
        assert_eq!(clamp_accuracy_m(None), 10.0);
    }
}
