//! ETA estimation
//!
//! Four strategies each produce a (seconds, confidence) candidate for a
//! segment; the single candidate with the highest confidence wins, with
//! ties resolved by computation order (historical, kalman, weighted,
//! simple). The weighted blend is computed even though the selection rule
//! means it rarely wins; that matches the observed behavior of the system
//! this replaces.

use chrono::{TimeDelta, Utc};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::TrackingConfig;
use crate::db;
use crate::models::{
    EstimationMethod, EtaEstimate, RouteBreakdown, RouteStop, SegmentEta, SpeedProfile,
    SpeedSample,
};
use crate::services::geo;
use crate::store::TtlCache;

/// Raw position pairs considered by the historical method
const HISTORY_SAMPLE_LIMIT: i64 = 100;
/// Pairwise speeds outside this band are GPS noise
const MAX_PLAUSIBLE_SPEED_KMH: f64 = 150.0;
/// Minimum valid samples before historical/kalman methods engage
const MIN_SAMPLES: usize = 3;
/// Acceleration below this is treated as constant speed, km/h per second
const ACCELERATION_FLOOR: f64 = 0.1;
/// Route breakdowns only look this many stops ahead
const MAX_BREAKDOWN_STOPS: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    secs: f64,
    confidence: f64,
    method: EstimationMethod,
}

#[derive(Clone)]
pub struct EtaEstimator {
    cache: TtlCache,
    pool: SqlitePool,
    config: TrackingConfig,
}

impl EtaEstimator {
    pub fn new(cache: TtlCache, pool: SqlitePool, config: TrackingConfig) -> Self {
        Self {
            cache,
            pool,
            config,
        }
    }

    fn buffer_key(vehicle_id: &str, trip_id: i64) -> String {
        format!("speed:{vehicle_id}:{trip_id}")
    }

    /// Append a speed sample to the bounded per-(vehicle, trip) buffer.
    /// Best-effort telemetry: failures are logged, never returned.
    pub fn record_speed(
        &self,
        vehicle_id: &str,
        trip_id: i64,
        speed_kmh: f64,
        accuracy: Option<f64>,
    ) {
        if !(0.0..=MAX_PLAUSIBLE_SPEED_KMH).contains(&speed_kmh) {
            tracing::debug!(vehicle_id, trip_id, speed_kmh, "Discarding implausible speed");
            return;
        }

        let sample = SpeedSample {
            captured_at: Utc::now(),
            speed_kmh,
            accuracy_m: geo::clamp_accuracy_m(accuracy),
        };
        let cap = self.config.speed_buffer_len;

        let result = self.cache.update::<Vec<SpeedSample>, (), _>(
            &Self::buffer_key(vehicle_id, trip_id),
            Duration::from_secs(self.config.speed_buffer_ttl_secs),
            |buffer| {
                let mut buffer = buffer.unwrap_or_default();
                buffer.push(sample);
                if buffer.len() > cap {
                    let excess = buffer.len() - cap;
                    buffer.drain(..excess);
                }
                (buffer, ())
            },
        );

        if let Err(e) = result {
            tracing::warn!(vehicle_id, trip_id, error = %e, "Failed to record speed sample");
        }
    }

    fn speed_buffer(&self, vehicle_id: &str, trip_id: i64) -> Vec<SpeedSample> {
        match self
            .cache
            .get::<Vec<SpeedSample>>(&Self::buffer_key(vehicle_id, trip_id))
        {
            Ok(Some(buffer)) => buffer,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(vehicle_id, trip_id, error = %e, "Speed buffer unavailable");
                Vec::new()
            }
        }
    }

    /// Speed statistics for a trip. With no samples the profile is a flat
    /// series at the fallback speed.
    pub fn speed_profile(&self, vehicle_id: &str, trip_id: i64) -> SpeedProfile {
        let buffer = self.speed_buffer(vehicle_id, trip_id);
        if buffer.is_empty() {
            let flat = self.config.fallback_speed_kmh;
            return SpeedProfile {
                current_kmh: flat,
                average_kmh: flat,
                max_kmh: flat,
                min_kmh: flat,
                sample_count: 0,
            };
        }

        let speeds: Vec<f64> = buffer.iter().map(|s| s.speed_kmh).collect();
        let sum: f64 = speeds.iter().sum();
        SpeedProfile {
            current_kmh: *speeds.last().unwrap_or(&0.0),
            average_kmh: sum / speeds.len() as f64,
            max_kmh: speeds.iter().cloned().fold(f64::MIN, f64::max),
            min_kmh: speeds.iter().cloned().fold(f64::MAX, f64::min),
            sample_count: speeds.len(),
        }
    }

    /// Lowest-trust fallback, always available.
    fn calculate_simple(&self, distance_km: f64, current_speed_kmh: f64) -> Candidate {
        let moving = current_speed_kmh > 0.0;
        let speed = if moving {
            current_speed_kmh
        } else {
            self.config.fallback_speed_kmh
        };
        Candidate {
            secs: distance_km / speed * 3600.0,
            confidence: if moving { 0.5 } else { 0.3 },
            method: EstimationMethod::Simple,
        }
    }

    /// Median speed over recent durable position pairs; robust to outliers.
    async fn calculate_historical(&self, vehicle_id: &str, distance_km: f64) -> Option<Candidate> {
        let rows = match db::query_recent_positions(&self.pool, vehicle_id, HISTORY_SAMPLE_LIMIT)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(vehicle_id, error = %e, "Historical position query failed");
                return None;
            }
        };

        // Rows are newest first; walk consecutive pairs.
        let mut speeds = Vec::new();
        for pair in rows.windows(2) {
            let (newer, older) = (&pair[0], &pair[1]);
            let dt_secs = (newer.captured_at - older.captured_at).num_seconds();
            if dt_secs <= 0 {
                continue;
            }
            let d_km = geo::haversine_distance_km(
                older.latitude,
                older.longitude,
                newer.latitude,
                newer.longitude,
            );
            let speed = d_km / (dt_secs as f64 / 3600.0);
            if speed > 0.0 && speed < MAX_PLAUSIBLE_SPEED_KMH {
                speeds.push(speed);
            }
        }

        if speeds.len() < MIN_SAMPLES {
            return None;
        }

        speeds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if speeds.len() % 2 == 0 {
            (speeds[speeds.len() / 2 - 1] + speeds[speeds.len() / 2]) / 2.0
        } else {
            speeds[speeds.len() / 2]
        };
        if median <= 0.0 {
            return None;
        }

        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        let variance =
            speeds.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / speeds.len() as f64;
        let stddev = variance.sqrt();
        let confidence = (1.0 - stddev / median).clamp(0.3, 0.95);

        Some(Candidate {
            secs: distance_km / median * 3600.0,
            confidence,
            method: EstimationMethod::Historical,
        })
    }

    /// Acceleration-projected estimate from the recent speed buffer.
    fn calculate_kalman(
        &self,
        vehicle_id: &str,
        trip_id: i64,
        distance_km: f64,
        current_speed_kmh: f64,
    ) -> Option<Candidate> {
        if current_speed_kmh <= 0.0 {
            return None;
        }
        let buffer = self.speed_buffer(vehicle_id, trip_id);
        if buffer.len() < MIN_SAMPLES {
            return None;
        }

        let oldest = buffer.first()?;
        let newest = buffer.last()?;
        let span_secs = (newest.captured_at - oldest.captured_at).num_seconds();
        if span_secs <= 0 {
            return None;
        }
        // km/h per second across the window
        let acceleration = (newest.speed_kmh - oldest.speed_kmh) / span_secs as f64;

        let secs = if acceleration > ACCELERATION_FLOOR {
            // v^2 = u^2 + 2as with a converted to km/h per hour, then
            // cover the segment at the blend of entry and projected speed.
            let a = acceleration * 3600.0;
            let u = current_speed_kmh;
            let v = (u * u + 2.0 * a * distance_km).sqrt();
            let blended = (u + v) / 2.0;
            distance_km / blended * 3600.0
        } else {
            distance_km / current_speed_kmh * 3600.0
        };

        let confidence: f64 = if current_speed_kmh > 5.0 { 0.8 } else { 0.5 };
        Some(Candidate {
            secs,
            confidence: confidence.min(0.9),
            method: EstimationMethod::Kalman,
        })
    }

    /// Confidence-weighted average of whichever methods produced a value.
    /// A blend of one input is just that input, so it needs at least two.
    fn calculate_weighted(candidates: &[Candidate]) -> Option<Candidate> {
        if candidates.len() < 2 {
            return None;
        }
        let weight_sum: f64 = candidates.iter().map(|c| c.confidence).sum();
        if weight_sum <= 0.0 {
            return None;
        }
        let secs =
            candidates.iter().map(|c| c.secs * c.confidence).sum::<f64>() / weight_sum;
        let confidence =
            candidates.iter().map(|c| c.confidence).sum::<f64>() / candidates.len() as f64;
        Some(Candidate {
            secs,
            confidence,
            method: EstimationMethod::Weighted,
        })
    }

    /// Estimate arrival for a single segment.
    pub async fn estimate_segment(
        &self,
        vehicle_id: &str,
        trip_id: Option<i64>,
        from: (f64, f64),
        to: (f64, f64),
        current_speed_kmh: f64,
    ) -> EtaEstimate {
        let distance_km = geo::haversine_distance_km(from.0, from.1, to.0, to.1);

        let simple = self.calculate_simple(distance_km, current_speed_kmh);
        let historical = self.calculate_historical(vehicle_id, distance_km).await;
        let kalman = trip_id
            .and_then(|t| self.calculate_kalman(vehicle_id, t, distance_km, current_speed_kmh));

        let mut contributors = vec![simple];
        contributors.extend(historical);
        contributors.extend(kalman);
        let weighted = Self::calculate_weighted(&contributors);

        // First max by confidence, in computation order.
        let ordered = [historical, kalman, weighted, Some(simple)];
        let best = ordered
            .into_iter()
            .flatten()
            .reduce(|best, c| if c.confidence > best.confidence { c } else { best })
            .unwrap_or(simple);

        EtaEstimate {
            distance_km,
            estimated_secs: best.secs.round() as i64,
            confidence: best.confidence,
            method: best.method,
        }
    }

    /// Per-stop arrival estimates for up to the next five remaining stops.
    pub async fn estimate_route_breakdown(
        &self,
        trip_id: i64,
        vehicle_id: &str,
        current: (f64, f64),
        current_speed_kmh: f64,
        remaining_stops: &[RouteStop],
    ) -> RouteBreakdown {
        let now = Utc::now();
        let mut segments = Vec::new();
        let mut from = current;
        let mut cumulative_secs = 0.0;
        let mut total_distance_km = 0.0;

        for (i, stop) in remaining_stops.iter().take(MAX_BREAKDOWN_STOPS).enumerate() {
            // Dwell at the previous stop before covering the next hop.
            if i > 0 {
                cumulative_secs += remaining_stops[i - 1].wait_secs as f64;
            }

            let estimate = self
                .estimate_segment(
                    vehicle_id,
                    Some(trip_id),
                    from,
                    (stop.lat, stop.lon),
                    current_speed_kmh,
                )
                .await;

            cumulative_secs += estimate.estimated_secs as f64;
            total_distance_km += estimate.distance_km;

            segments.push(SegmentEta {
                stop_id: stop.stop_id,
                stop_name: stop.stop_name.clone(),
                sequence: stop.sequence,
                distance_km: estimate.distance_km,
                estimated_secs: cumulative_secs.round() as i64,
                arrival_at: now + TimeDelta::seconds(cumulative_secs.round() as i64),
                confidence: estimate.confidence,
            });

            from = (stop.lat, stop.lon);
        }

        let overall_confidence = if segments.is_empty() {
            0.0
        } else {
            segments.iter().map(|s| s.confidence).sum::<f64>() / segments.len() as f64
        };

        RouteBreakdown {
            trip_id,
            vehicle_id: vehicle_id.to_string(),
            total_secs: cumulative_secs.round() as i64,
            total_distance_km,
            overall_confidence,
            speed_profile: self.speed_profile(vehicle_id, trip_id),
            segments,
            calculated_at: now,
        }
    }
}
