//! Ephemeral location store
//!
//! Holds each vehicle's most recent position in the TTL cache, publishes
//! every new sample to the fan-out channel, and appends a durable snapshot
//! at most once per snapshot interval per vehicle. Once the TTL elapses a
//! vehicle is simply absent - "location unknown" - which callers must treat
//! as distinct from an explicit offline status.

use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;

use crate::config::TrackingConfig;
use crate::db;
use crate::events::EventPublisher;
use crate::models::{HistoricalPosition, VehiclePosition, VehicleStatus};
use crate::services::geo::{self, CoordinateError};
use crate::store::TtlCache;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error(transparent)]
    InvalidCoordinates(#[from] CoordinateError),
}

/// Marker stored under `snapshot:{vehicle_id}` while a durable snapshot is
/// still fresh; its expiry is what schedules the next one.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotMarker {
    stored_at_ms: i64,
}

#[derive(Clone)]
pub struct LocationService {
    cache: TtlCache,
    pool: SqlitePool,
    publisher: EventPublisher,
    config: TrackingConfig,
}

impl LocationService {
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

    fn location_key(vehicle_id: &str) -> String {
        format!("location:{vehicle_id}")
    }

    fn snapshot_key(vehicle_id: &str) -> String {
        format!("snapshot:{vehicle_id}")
    }

    /// Record a new position sample for a vehicle.
    ///
    /// The cached entry is overwritten unconditionally (last write wins),
    /// the sample is published, and a durable snapshot is appended unless
    /// one was taken within the snapshot interval. Snapshot failures are
    /// logged and swallowed; the capture itself still succeeds.
    pub async fn capture(
        &self,
        vehicle_id: &str,
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
        trip_id: Option<i64>,
    ) -> Result<VehiclePosition, LocationError> {
        geo::validate_coordinates(latitude, longitude)?;

        let position = VehiclePosition {
            vehicle_id: vehicle_id.to_string(),
            latitude,
            longitude,
            accuracy_m: geo::clamp_accuracy_m(accuracy),
            status: VehicleStatus::Online,
            trip_id,
            captured_at: Utc::now(),
        };

        let ttl = Duration::from_secs(self.config.location_ttl_secs);
        if let Err(e) = self
            .cache
            .set(&Self::location_key(vehicle_id), &position, ttl)
        {
            tracing::warn!(vehicle_id, error = %e, "Failed to cache position");
        }

        self.publisher
            .publish(EventPublisher::location_topic(vehicle_id), &position);

        if self.snapshot_due(vehicle_id) {
            self.append_snapshot(&position).await;
        }

        Ok(position)
    }

    /// Current cached position, or None once the TTL has elapsed.
    pub fn current(&self, vehicle_id: &str) -> Option<VehiclePosition> {
        match self.cache.get(&Self::location_key(vehicle_id)) {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!(vehicle_id, error = %e, "Location cache unavailable");
                None
            }
        }
    }

    /// Flip the cached entry to offline, keeping it readable for the
    /// remainder of its TTL. Returns the updated position if one existed.
    pub fn mark_offline(&self, vehicle_id: &str) -> Option<VehiclePosition> {
        let mut position = self.current(vehicle_id)?;
        position.status = VehicleStatus::Offline;

        let ttl = Duration::from_secs(self.config.location_ttl_secs);
        if let Err(e) = self
            .cache
            .set(&Self::location_key(vehicle_id), &position, ttl)
        {
            tracing::warn!(vehicle_id, error = %e, "Failed to mark vehicle offline");
            return None;
        }

        self.publisher
            .publish(EventPublisher::location_topic(vehicle_id), &position);
        Some(position)
    }

    /// Every non-expired cached position.
    pub fn active_vehicles(&self) -> Vec<VehiclePosition> {
        match self.cache.scan_prefix::<VehiclePosition>("location:") {
            Ok(entries) => entries.into_iter().map(|(_, p)| p).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Location cache unavailable for scan");
                Vec::new()
            }
        }
    }

    fn snapshot_due(&self, vehicle_id: &str) -> bool {
        match self
            .cache
            .get::<SnapshotMarker>(&Self::snapshot_key(vehicle_id))
        {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                // Unreadable marker: skip rather than risk a snapshot storm.
                tracing::warn!(vehicle_id, error = %e, "Snapshot marker unavailable");
                false
            }
        }
    }

    async fn append_snapshot(&self, position: &VehiclePosition) {
        let historical = HistoricalPosition {
            vehicle_id: position.vehicle_id.clone(),
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy_m: position.accuracy_m,
            status: position.status,
            trip_id: position.trip_id,
            captured_at: position.captured_at,
            stored_at: Utc::now(),
        };

        if let Err(e) = db::append_historical_position(&self.pool, &historical).await {
            tracing::warn!(
                vehicle_id = %position.vehicle_id,
                error = %e,
                "Failed to append historical position"
            );
            return;
        }

        let marker = SnapshotMarker {
            stored_at_ms: Utc::now().timestamp_millis(),
        };
        let interval = Duration::from_secs(self.config.snapshot_interval_secs);
        if let Err(e) = self
            .cache
            .set(&Self::snapshot_key(&position.vehicle_id), &marker, interval)
        {
            tracing::warn!(
                vehicle_id = %position.vehicle_id,
                error = %e,
                "Failed to record snapshot marker"
            );
        }
    }

    /// One pass of the background snapshot sweep: walk every cached
    /// position and append a durable snapshot for any vehicle whose marker
    /// has expired. Idempotent, and a silent vehicle (expired position) is
    /// skipped automatically because its cache entry is gone.
    pub async fn snapshot_sweep(&self) -> usize {
        let mut taken = 0;
        for position in self.active_vehicles() {
            if self.snapshot_due(&position.vehicle_id) {
                self.append_snapshot(&position).await;
                taken += 1;
            }
        }
        if taken > 0 {
            tracing::info!(snapshots = taken, "Snapshot sweep appended positions");
        }
        taken
    }
}
