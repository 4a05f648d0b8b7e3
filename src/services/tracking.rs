//! Location-ingest pipeline
//!
//! One submitted sample flows through: rate limiting (vehicle, then
//! driver), the ephemeral location store, geofence evaluation against the
//! trip's route, and a trip-progress refresh. Everything past the store is
//! a side path: its failure is logged and the capture still succeeds.

use sqlx::SqlitePool;
use thiserror::Error;

use crate::config::TrackingConfig;
use crate::db;
use crate::events::EventPublisher;
use crate::models::{GeofenceEvent, TripSnapshot, VehiclePosition};
use crate::services::eta::EtaEstimator;
use crate::services::geofence::GeofenceDetector;
use crate::services::location::{LocationError, LocationService};
use crate::services::progress::TripProgressTracker;
use crate::services::rate_limit::{RateLimitDecision, RateLimiter, SubjectType};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error("rate limited")]
    RateLimited(RateLimitDecision),
}

/// What one accepted submission produced
#[derive(Debug)]
pub struct CaptureOutcome {
    pub position: VehiclePosition,
    pub geofence_events: Vec<GeofenceEvent>,
    pub trip: Option<TripSnapshot>,
}

/// A location submission as received from a driver device
#[derive(Debug, Clone)]
pub struct LocationSubmission {
    pub vehicle_id: String,
    pub driver_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub trip_id: Option<i64>,
}

#[derive(Clone)]
pub struct TrackingPipeline {
    pool: SqlitePool,
    config: TrackingConfig,
    limiter: RateLimiter,
    pub locations: LocationService,
    pub geofence: GeofenceDetector,
    pub progress: TripProgressTracker,
    pub estimator: EtaEstimator,
    publisher: EventPublisher,
}

impl TrackingPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        config: TrackingConfig,
        limiter: RateLimiter,
        locations: LocationService,
        geofence: GeofenceDetector,
        progress: TripProgressTracker,
        estimator: EtaEstimator,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            pool,
            config,
            limiter,
            locations,
            geofence,
            progress,
            estimator,
            publisher,
        }
    }

    /// Run the full ingest pipeline for one submission.
    pub async fn capture(
        &self,
        school_id: &str,
        submission: LocationSubmission,
    ) -> Result<CaptureOutcome, CaptureError> {
        let vehicle_decision = self.limiter.admit(
            SubjectType::Vehicle,
            &submission.vehicle_id,
            self.config.vehicle_rate_limit,
        );
        if !vehicle_decision.allowed {
            return Err(CaptureError::RateLimited(vehicle_decision));
        }

        if let Some(driver_id) = submission.driver_id.as_deref() {
            let driver_decision =
                self.limiter
                    .admit(SubjectType::Driver, driver_id, self.config.driver_rate_limit);
            if !driver_decision.allowed {
                return Err(CaptureError::RateLimited(driver_decision));
            }
        }

        let position = self
            .locations
            .capture(
                &submission.vehicle_id,
                submission.latitude,
                submission.longitude,
                submission.accuracy,
                submission.trip_id,
            )
            .await?;

        let mut geofence_events = Vec::new();
        let mut trip_snapshot = None;

        if let Some(trip_id) = submission.trip_id {
            match db::find_trip(&self.pool, trip_id, school_id).await {
                Ok(Some(trip)) => {
                    match db::find_route_stops(&self.pool, trip.route_id).await {
                        Ok(stops) => {
                            geofence_events = self.geofence.evaluate(
                                trip_id,
                                &submission.vehicle_id,
                                &stops,
                                submission.latitude,
                                submission.longitude,
                            );
                            for event in &geofence_events {
                                self.publisher.publish(
                                    EventPublisher::geofence_topic(&submission.vehicle_id),
                                    event,
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(trip_id, error = %e, "Route stops unavailable");
                        }
                    }

                    match self
                        .progress
                        .progress(trip_id, school_id, submission.latitude, submission.longitude)
                        .await
                    {
                        Ok(snapshot) => trip_snapshot = snapshot,
                        Err(e) => {
                            tracing::warn!(trip_id, error = %e, "Trip progress unavailable");
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(trip_id, school_id, "Submission references unknown trip");
                }
                Err(e) => {
                    tracing::warn!(trip_id, error = %e, "Trip lookup failed");
                }
            }
        }

        Ok(CaptureOutcome {
            position,
            geofence_events,
            trip: trip_snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeofenceAction;
    use crate::services::geofence::spawn_boarding_worker;
    use crate::store::TtlCache;

    const SCHOOL: &str = "school-1";

    async fn pipeline() -> TrackingPipeline {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let cache = TtlCache::new();
        let config = TrackingConfig::default();
        let publisher = EventPublisher::new(64);
        let boarding_tx = spawn_boarding_worker(pool.clone(), cache.clone());

        TrackingPipeline::new(
            pool.clone(),
            config.clone(),
            RateLimiter::new(cache.clone()),
            LocationService::new(cache.clone(), pool.clone(), publisher.clone(), config.clone()),
            GeofenceDetector::new(cache.clone(), config.clone(), boarding_tx),
            TripProgressTracker::new(cache.clone(), pool.clone(), publisher.clone(), config.clone()),
            EtaEstimator::new(cache.clone(), pool, config),
            publisher,
        )
    }

    async fn seed_trip(pool: &SqlitePool) -> i64 {
        sqlx::query("INSERT INTO routes (id, school_id, name) VALUES (1, ?, 'Morning run')")
            .bind(SCHOOL)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO route_stops (id, route_id, stop_name, sequence, lat, lon, wait_secs)
             VALUES (1, 1, 'Stop 1', 1, 48.0, 11.0, 0)",
        )
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO trips (id, school_id, route_id, vehicle_id, driver_id, status, trip_date)
             VALUES (7, ?, 1, 'bus-1', 'driver-1', 'running', '2026-08-25')",
        )
        .bind(SCHOOL)
        .execute(pool)
        .await
        .unwrap();
        7
    }

    fn submission(vehicle_id: &str, lat: f64, trip_id: Option<i64>) -> LocationSubmission {
        LocationSubmission {
            vehicle_id: vehicle_id.to_string(),
            driver_id: Some("driver-1".to_string()),
            latitude: lat,
            longitude: 11.0,
            accuracy: Some(10.0),
            trip_id,
        }
    }

    #[tokio::test]
    async fn capture_near_stop_fires_arrival_and_reports_progress() {
        let pipeline = pipeline().await;
        let trip_id = seed_trip(&pipeline.pool).await;
        let mut rx = pipeline.publisher.subscribe();

        let outcome = pipeline
            .capture(SCHOOL, submission("bus-1", 48.0003, Some(trip_id)))
            .await
            .unwrap();

        assert_eq!(outcome.geofence_events.len(), 1);
        assert_eq!(outcome.geofence_events[0].action, GeofenceAction::Arrived);
        let trip = outcome.trip.unwrap();
        assert_eq!(trip.trip_id, trip_id);
        assert_eq!(trip.completed_stops, 0);

        // location + geofence + trip events all reach subscribers
        let mut topics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            topics.push(event.topic);
        }
        assert!(topics.contains(&"location:bus-1".to_string()), "{topics:?}");
        assert!(topics.contains(&"geofence:bus-1".to_string()), "{topics:?}");
        assert!(topics.contains(&format!("trip:{trip_id}")), "{topics:?}");
    }

    #[tokio::test]
    async fn vehicle_cap_rejects_eleventh_submission() {
        let pipeline = pipeline().await;

        for i in 0..10 {
            let result = pipeline.capture(SCHOOL, submission("bus-1", 48.0, None)).await;
            assert!(result.is_ok(), "submission {i} should pass");
        }

        match pipeline.capture(SCHOOL, submission("bus-1", 48.0, None)).await {
            Err(CaptureError::RateLimited(decision)) => {
                assert!(!decision.allowed);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limits_are_isolated_per_vehicle() {
        let pipeline = pipeline().await;

        for _ in 0..10 {
            pipeline
                .capture(SCHOOL, submission("bus-1", 48.0, None))
                .await
                .unwrap();
        }
        assert!(pipeline
            .capture(SCHOOL, submission("bus-1", 48.0, None))
            .await
            .is_err());

        // bus-2 shares the driver though, and the driver cap is 20.
        let mut other = submission("bus-2", 48.0, None);
        other.driver_id = Some("driver-2".to_string());
        assert!(pipeline.capture(SCHOOL, other).await.is_ok());
    }

    #[tokio::test]
    async fn driver_cap_applies_across_vehicles() {
        let pipeline = pipeline().await;

        // Same driver alternating between three vehicles: the 21st
        // submission trips the driver window even though no vehicle has
        // hit its own cap.
        for i in 0..20 {
            let vehicle = format!("bus-{}", i % 3);
            pipeline
                .capture(SCHOOL, submission(&vehicle, 48.0, None))
                .await
                .unwrap();
        }
        let result = pipeline
            .capture(SCHOOL, submission("bus-0", 48.0, None))
            .await;
        assert!(matches!(result, Err(CaptureError::RateLimited(_))));
    }

    #[tokio::test]
    async fn unknown_trip_still_captures_position() {
        let pipeline = pipeline().await;

        let outcome = pipeline
            .capture(SCHOOL, submission("bus-1", 48.0, Some(999)))
            .await
            .unwrap();

        assert!(outcome.geofence_events.is_empty());
        assert!(outcome.trip.is_none());
        assert!(pipeline.locations.current("bus-1").is_some());
    }
}
