//! Trip progress tracking
//!
//! Combines the durable trip/route/boarding data with the vehicle's current
//! position into a short-lived snapshot: how many stops are done, which
//! stop is next, and the student tallies. Snapshots are cached per trip and
//! invalidated whenever an alighting is recorded.

use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::TrackingConfig;
use crate::db;
use crate::events::EventPublisher;
use crate::models::{NextStop, TripSnapshot};
use crate::services::geo;
use crate::store::TtlCache;

#[derive(Clone)]
pub struct TripProgressTracker {
    cache: TtlCache,
    pool: SqlitePool,
    publisher: EventPublisher,
    config: TrackingConfig,
}

impl TripProgressTracker {
    pub fn new(
        cache: TtlCache,
        pool: SqlitePool,
        publisher: EventPublisher,
        config: TrackingConfig,
    ) -> Self {
        Self {
            cache,
            pool,
            publisher,
            config,
        }
    }

    fn progress_key(trip_id: i64) -> String {
        format!("progress:{trip_id}")
    }

    /// Drop the cached snapshot so the next read recomputes. Called when a
    /// stop is explicitly completed (an alighting lands).
    pub fn invalidate(&self, trip_id: i64) {
        if let Err(e) = self.cache.delete(&Self::progress_key(trip_id)) {
            tracing::warn!(trip_id, error = %e, "Progress cache invalidation failed");
        }
    }

    /// Current snapshot for a trip, or None when the trip or its route is
    /// unknown (or belongs to another school).
    pub async fn progress(
        &self,
        trip_id: i64,
        school_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Option<TripSnapshot>, sqlx::Error> {
        let key = Self::progress_key(trip_id);
        match self.cache.get::<TripSnapshot>(&key) {
            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(trip_id, error = %e, "Progress cache unavailable");
            }
        }

        let Some(trip) = db::find_trip(&self.pool, trip_id, school_id).await? else {
            return Ok(None);
        };
        let stops = db::find_route_stops(&self.pool, trip.route_id).await?;
        if stops.is_empty() {
            return Ok(None);
        }

        let total_stops = stops.len();
        let completed_stops = db::count_alighted_stops(&self.pool, trip_id).await? as usize;
        let completed_stops = completed_stops.min(total_stops);
        let current_stop_index = completed_stops.min(total_stops - 1);

        let next_stop = if completed_stops < total_stops {
            let stop = &stops[current_stop_index];
            let distance_km = geo::haversine_distance_km(lat, lon, stop.lat, stop.lon);
            // Flat fallback speed here; callers needing richer estimates
            // use the ETA estimator directly.
            let eta_secs =
                (distance_km / self.config.fallback_speed_kmh * 3600.0).round() as i64;
            Some(NextStop {
                stop_id: stop.stop_id,
                stop_name: stop.stop_name.clone(),
                sequence: stop.sequence,
                lat: stop.lat,
                lon: stop.lon,
                distance_km,
                eta_secs,
            })
        } else {
            None
        };

        let students = db::student_counts(&self.pool, trip_id).await?;
        let progress_percentage =
            ((completed_stops as f64 / total_stops as f64) * 100.0).round() as u8;

        let snapshot = TripSnapshot {
            trip_id,
            route_id: trip.route_id,
            vehicle_id: trip.vehicle_id,
            total_stops,
            completed_stops,
            current_stop_index,
            next_stop,
            progress_percentage,
            students,
            updated_at: Utc::now(),
        };

        let ttl = Duration::from_secs(self.config.progress_cache_ttl_secs);
        if let Err(e) = self.cache.set(&key, &snapshot, ttl) {
            tracing::warn!(trip_id, error = %e, "Failed to cache trip snapshot");
        }

        self.publisher
            .publish(EventPublisher::trip_topic(trip_id), &snapshot);

        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHOOL: &str = "school-1";

    async fn tracker() -> TripProgressTracker {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        TripProgressTracker::new(
            TtlCache::new(),
            pool,
            EventPublisher::new(16),
            TrackingConfig::default(),
        )
    }

    /// Route with four stops 1 km apart, one trip, two students per stop.
    async fn seed_trip(pool: &SqlitePool) -> i64 {
        sqlx::query("INSERT INTO routes (id, school_id, name) VALUES (1, ?, 'Morning run')")
            .bind(SCHOOL)
            .execute(pool)
            .await
            .unwrap();
        for i in 1..=4 {
            sqlx::query(
                "INSERT INTO route_stops (id, route_id, stop_name, sequence, lat, lon, wait_secs)
                 VALUES (?, 1, ?, ?, ?, 0.0, 0)",
            )
            .bind(i)
            .bind(format!("Stop {i}"))
            .bind(i)
            .bind(i as f64 / 111.32)
            .execute(pool)
            .await
            .unwrap();
        }
        sqlx::query(
            "INSERT INTO trips (id, school_id, route_id, vehicle_id, driver_id, status, trip_date)
             VALUES (7, ?, 1, 'bus-1', 'driver-1', 'running', '2026-08-25')",
        )
        .bind(SCHOOL)
        .execute(pool)
        .await
        .unwrap();
        for stop in 1..=4i64 {
            for student in 0..2 {
                sqlx::query(
                    "INSERT INTO student_trip_records (trip_id, student_id, stop_id)
                     VALUES (7, ?, ?)",
                )
                .bind(format!("student-{stop}-{student}"))
                .bind(stop)
                .execute(pool)
                .await
                .unwrap();
            }
        }
        7
    }

    async fn alight_stop(pool: &SqlitePool, trip_id: i64, stop_id: i64) {
        db::mark_students_boarded(pool, trip_id, stop_id, Utc::now())
            .await
            .unwrap();
        db::mark_students_alighted(pool, trip_id, stop_id, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_of_four_stops_completed_is_half_progress() {
        let tracker = tracker().await;
        let trip_id = seed_trip(&tracker.pool).await;
        alight_stop(&tracker.pool, trip_id, 1).await;
        alight_stop(&tracker.pool, trip_id, 2).await;

        let snapshot = tracker
            .progress(trip_id, SCHOOL, 0.0, 0.0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.total_stops, 4);
        assert_eq!(snapshot.completed_stops, 2);
        assert_eq!(snapshot.progress_percentage, 50);
        assert_eq!(snapshot.current_stop_index, 2);
        assert_eq!(snapshot.next_stop.as_ref().unwrap().stop_id, 3);
        assert_eq!(snapshot.students.alighted, 4);
        assert_eq!(snapshot.students.boarded, 4);
        assert_eq!(snapshot.students.expected, 8);
    }

    #[tokio::test]
    async fn fresh_trip_points_at_first_stop() {
        let tracker = tracker().await;
        let trip_id = seed_trip(&tracker.pool).await;

        let snapshot = tracker
            .progress(trip_id, SCHOOL, 0.0, 0.0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.completed_stops, 0);
        assert_eq!(snapshot.progress_percentage, 0);
        let next = snapshot.next_stop.unwrap();
        assert_eq!(next.stop_id, 1);
        // 1 km away at the 40 km/h fallback
        assert!((next.eta_secs - 90).abs() <= 3, "got {}", next.eta_secs);
    }

    #[tokio::test]
    async fn completed_trip_has_no_next_stop() {
        let tracker = tracker().await;
        let trip_id = seed_trip(&tracker.pool).await;
        for stop in 1..=4 {
            alight_stop(&tracker.pool, trip_id, stop).await;
        }

        let snapshot = tracker
            .progress(trip_id, SCHOOL, 0.0, 0.0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.progress_percentage, 100);
        assert!(snapshot.next_stop.is_none());
        assert_eq!(snapshot.current_stop_index, 3);
    }

    #[tokio::test]
    async fn unknown_trip_or_wrong_school_is_absent() {
        let tracker = tracker().await;
        let trip_id = seed_trip(&tracker.pool).await;

        assert!(tracker.progress(999, SCHOOL, 0.0, 0.0).await.unwrap().is_none());
        assert!(tracker
            .progress(trip_id, "other-school", 0.0, 0.0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_invalidated() {
        let tracker = tracker().await;
        let trip_id = seed_trip(&tracker.pool).await;

        let first = tracker
            .progress(trip_id, SCHOOL, 0.0, 0.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.completed_stops, 0);

        alight_stop(&tracker.pool, trip_id, 1).await;

        // Still the cached snapshot.
        let cached = tracker
            .progress(trip_id, SCHOOL, 0.0, 0.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.completed_stops, 0);

        tracker.invalidate(trip_id);
        let fresh = tracker
            .progress(trip_id, SCHOOL, 0.0, 0.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.completed_stops, 1);
    }
}
