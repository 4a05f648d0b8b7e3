//! Durable-store queries
//!
//! Everything the tracking core reads from or appends to the relational
//! store lives here: trip/route lookups, alighting counts, the historical
//! position log, and the boarding/alighting record mutations triggered by
//! geofence transitions.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::models::{HistoricalPosition, RouteStop, StudentCounts, VehicleStatus};

#[derive(Debug, Clone, FromRow)]
pub struct TripRow {
    pub id: i64,
    pub route_id: i64,
    pub vehicle_id: String,
    pub driver_id: Option<String>,
    pub status: String,
    pub school_id: String,
}

#[derive(Debug, FromRow)]
struct RouteStopRow {
    stop_id: i64,
    stop_name: Option<String>,
    sequence: i64,
    lat: f64,
    lon: f64,
    wait_secs: i64,
}

/// A raw position pair source for historical speed estimation
#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

pub async fn find_trip(
    pool: &SqlitePool,
    trip_id: i64,
    school_id: &str,
) -> Result<Option<TripRow>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, route_id, vehicle_id, driver_id, status, school_id
         FROM trips WHERE id = ? AND school_id = ?",
    )
    .bind(trip_id)
    .bind(school_id)
    .fetch_optional(pool)
    .await
}

/// Ordered stops for a route
pub async fn find_route_stops(
    pool: &SqlitePool,
    route_id: i64,
) -> Result<Vec<RouteStop>, sqlx::Error> {
    let rows: Vec<RouteStopRow> = sqlx::query_as(
        "SELECT id as stop_id, stop_name, sequence, lat, lon, wait_secs
         FROM route_stops WHERE route_id = ? ORDER BY sequence",
    )
    .bind(route_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| RouteStop {
            stop_id: r.stop_id,
            stop_name: r.stop_name,
            sequence: r.sequence,
            lat: r.lat,
            lon: r.lon,
            wait_secs: r.wait_secs,
        })
        .collect())
}

/// Number of distinct stops on a trip with at least one recorded alighting
pub async fn count_alighted_stops(pool: &SqlitePool, trip_id: i64) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT stop_id) FROM student_trip_records
         WHERE trip_id = ? AND alighted = 1",
    )
    .bind(trip_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn student_counts(pool: &SqlitePool, trip_id: i64) -> Result<StudentCounts, sqlx::Error> {
    let (expected, boarded, alighted, absent): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT
            COUNT(*),
            COALESCE(SUM(boarded), 0),
            COALESCE(SUM(alighted), 0),
            COALESCE(SUM(absent), 0)
         FROM student_trip_records WHERE trip_id = ?",
    )
    .bind(trip_id)
    .fetch_one(pool)
    .await?;

    Ok(StudentCounts {
        boarded,
        alighted,
        absent,
        expected,
    })
}

/// Mark every student waiting at a stop as boarded
///
/// Absent students are never boarded; already-boarded rows are untouched so
/// the mutation is idempotent.
pub async fn mark_students_boarded(
    pool: &SqlitePool,
    trip_id: i64,
    stop_id: i64,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE student_trip_records
         SET boarded = 1, boarding_time = ?
         WHERE trip_id = ? AND stop_id = ? AND absent = 0 AND boarded = 0",
    )
    .bind(at)
    .bind(trip_id)
    .bind(stop_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Mark every boarded student destined for a stop as alighted
pub async fn mark_students_alighted(
    pool: &SqlitePool,
    trip_id: i64,
    stop_id: i64,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE student_trip_records
         SET alighted = 1, alighting_time = ?
         WHERE trip_id = ? AND stop_id = ? AND boarded = 1 AND alighted = 0",
    )
    .bind(at)
    .bind(trip_id)
    .bind(stop_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn append_historical_position(
    pool: &SqlitePool,
    position: &HistoricalPosition,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO historical_positions
            (vehicle_id, latitude, longitude, accuracy_m, status, trip_id, captured_at, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&position.vehicle_id)
    .bind(position.latitude)
    .bind(position.longitude)
    .bind(position.accuracy_m)
    .bind(position.status.as_str())
    .bind(position.trip_id)
    .bind(position.captured_at)
    .bind(position.stored_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent durable positions for a vehicle, newest first
pub async fn query_recent_positions(
    pool: &SqlitePool,
    vehicle_id: &str,
    limit: i64,
) -> Result<Vec<PositionRow>, sqlx::Error> {
    sqlx::query_as(
        "SELECT latitude, longitude, captured_at FROM historical_positions
         WHERE vehicle_id = ? ORDER BY captured_at DESC LIMIT ?",
    )
    .bind(vehicle_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[derive(Debug, FromRow)]
pub struct HistoryRow {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub status: String,
    pub trip_id: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

/// Time-bounded position history for a vehicle, oldest first
pub async fn query_position_history(
    pool: &SqlitePool,
    vehicle_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<HistoryRow>, sqlx::Error> {
    sqlx::query_as(
        "SELECT vehicle_id, latitude, longitude, accuracy_m, status, trip_id, captured_at, stored_at
         FROM historical_positions
         WHERE vehicle_id = ? AND captured_at >= ? AND captured_at <= ?
         ORDER BY captured_at ASC LIMIT ?",
    )
    .bind(vehicle_id)
    .bind(start)
    .bind(end)
    .bind(limit)
    .fetch_all(pool)
    .await
}

impl HistoryRow {
    pub fn into_position(self) -> HistoricalPosition {
        HistoricalPosition {
            vehicle_id: self.vehicle_id,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_m: self.accuracy_m,
            status: VehicleStatus::parse(&self.status),
            trip_id: self.trip_id,
            captured_at: self.captured_at,
            stored_at: self.stored_at,
        }
    }
}
