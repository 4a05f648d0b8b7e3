//! Geofence transition detection
//!
//! Every position update is classified against every stop on the trip's
//! route (GPS noise or a detour can put a vehicle near a non-sequential
//! stop). The per-(vehicle, stop) band is kept in the ephemeral cache and a
//! transition event fires exactly once per band change:
//!
//!   outside -> approaching   emits APPROACHING
//!   any     -> arrived       emits ARRIVED (unless already arrived)
//!   arrived -> outside       emits DEPARTED
//!
//! arrived -> approaching emits nothing, so drifting back into the approach
//! band after an arrival never re-fires. Losing the cached state only costs
//! deduplication, never correctness of the durable record.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::TrackingConfig;
use crate::models::{GeofenceAction, GeofenceEvent, GeofenceZone, RouteStop};
use crate::services::geo;
use crate::store::TtlCache;

/// How long a (vehicle, stop) band survives without being refreshed
const STATE_TTL: Duration = Duration::from_secs(3600);

/// Boarding-record mutation requested by a geofence transition.
///
/// Sent over an unbounded channel to a background worker so a database
/// hiccup can never block or fail the position-ingest call that detected
/// the transition.
#[derive(Debug, Clone)]
pub enum BoardingCommand {
    Board {
        trip_id: i64,
        stop_id: i64,
        at: DateTime<Utc>,
    },
    Alight {
        trip_id: i64,
        stop_id: i64,
        at: DateTime<Utc>,
    },
}

pub type BoardingSender = mpsc::UnboundedSender<BoardingCommand>;

/// Spawn the worker that applies boarding commands to the durable store.
/// Failures are logged and dropped. After an alighting the trip's cached
/// progress snapshot is invalidated so the next read recomputes.
pub fn spawn_boarding_worker(pool: SqlitePool, cache: TtlCache) -> BoardingSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<BoardingCommand>();

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                BoardingCommand::Board {
                    trip_id,
                    stop_id,
                    at,
                } => match crate::db::mark_students_boarded(&pool, trip_id, stop_id, at).await {
                    Ok(rows) => {
                        tracing::info!(trip_id, stop_id, students = rows, "Marked students boarded");
                    }
                    Err(e) => {
                        tracing::warn!(trip_id, stop_id, error = %e, "Boarding update failed");
                    }
                },
                BoardingCommand::Alight {
                    trip_id,
                    stop_id,
                    at,
                } => {
                    match crate::db::mark_students_alighted(&pool, trip_id, stop_id, at).await {
                        Ok(rows) => {
                            tracing::info!(
                                trip_id,
                                stop_id,
                                students = rows,
                                "Marked students alighted"
                            );
                            if let Err(e) = cache.delete(&format!("progress:{trip_id}")) {
                                tracing::warn!(trip_id, error = %e, "Progress invalidation failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(trip_id, stop_id, error = %e, "Alighting update failed");
                        }
                    }
                }
            }
        }
    });

    tx
}

#[derive(Clone)]
pub struct GeofenceDetector {
    cache: TtlCache,
    config: TrackingConfig,
    boarding_tx: BoardingSender,
}

impl GeofenceDetector {
    pub fn new(cache: TtlCache, config: TrackingConfig, boarding_tx: BoardingSender) -> Self {
        Self {
            cache,
            config,
            boarding_tx,
        }
    }

    fn state_key(vehicle_id: &str, stop_id: i64) -> String {
        format!("geofence:{vehicle_id}:{stop_id}")
    }

    fn classify(&self, distance_m: f64) -> GeofenceZone {
        if distance_m <= self.config.arrival_radius_m {
            GeofenceZone::Arrived
        } else if distance_m <= self.config.approach_radius_m {
            GeofenceZone::Approaching
        } else {
            GeofenceZone::Outside
        }
    }

    /// Evaluate one position against every stop on the route, returning the
    /// transitions that fired. The stored band is updated regardless of
    /// whether an event fired, under a single per-key write lock so
    /// concurrent samples for the same vehicle cannot double-fire.
    pub fn evaluate(
        &self,
        trip_id: i64,
        vehicle_id: &str,
        stops: &[RouteStop],
        lat: f64,
        lon: f64,
    ) -> Vec<GeofenceEvent> {
        let now = Utc::now();
        let mut events = Vec::new();

        for stop in stops {
            let distance_m = geo::haversine_distance_m(lat, lon, stop.lat, stop.lon);
            let next = self.classify(distance_m);
            let key = Self::state_key(vehicle_id, stop.stop_id);

            let action = match self.cache.update::<GeofenceZone, _, _>(&key, STATE_TTL, |prev| {
                let prev = prev.unwrap_or(GeofenceZone::Outside);
                (next, Self::transition_action(prev, next))
            }) {
                Ok(action) => action,
                Err(e) => {
                    // Without state we cannot dedup; stay silent rather
                    // than spam duplicate transitions.
                    tracing::warn!(vehicle_id, stop_id = stop.stop_id, error = %e,
                        "Geofence state unavailable, skipping stop");
                    continue;
                }
            };

            let Some(action) = action else { continue };

            let event = GeofenceEvent {
                stop_id: stop.stop_id,
                stop_name: stop.stop_name.clone(),
                action,
                distance_m,
                timestamp: now,
            };

            match action {
                GeofenceAction::Arrived => {
                    let _ = self.boarding_tx.send(BoardingCommand::Board {
                        trip_id,
                        stop_id: stop.stop_id,
                        at: now,
                    });
                }
                GeofenceAction::Departed => {
                    let _ = self.boarding_tx.send(BoardingCommand::Alight {
                        trip_id,
                        stop_id: stop.stop_id,
                        at: now,
                    });
                }
                GeofenceAction::Approaching => {}
            }

            events.push(event);
        }

        events
    }

    fn transition_action(prev: GeofenceZone, next: GeofenceZone) -> Option<GeofenceAction> {
        if prev == next {
            return None;
        }
        match (prev, next) {
            (GeofenceZone::Outside, GeofenceZone::Approaching) => Some(GeofenceAction::Approaching),
            (_, GeofenceZone::Arrived) => Some(GeofenceAction::Arrived),
            (GeofenceZone::Arrived, GeofenceZone::Outside) => Some(GeofenceAction::Departed),
            // Leaving the approach band without having arrived, or easing
            // back from arrived into the approach band, is not a transition
            // worth reporting.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn stop_at(stop_id: i64, lat: f64, lon: f64) -> RouteStop {
        RouteStop {
            stop_id,
            stop_name: Some(format!("Stop {stop_id}")),
            sequence: stop_id,
            lat,
            lon,
            wait_secs: 0,
        }
    }

    /// Offset north of a reference point by roughly `meters`.
    fn north_of(lat: f64, meters: f64) -> f64 {
        lat + meters / 111_320.0
    }

    fn detector() -> (GeofenceDetector, mpsc::UnboundedReceiver<BoardingCommand>) {
        let (tx, rx) = unbounded_channel();
        (
            GeofenceDetector::new(TtlCache::new(), TrackingConfig::default(), tx),
            rx,
        )
    }

    #[test]
    fn approach_arrive_depart_sequence_fires_each_once() {
        let (detector, _rx) = detector();
        let stop = vec![stop_at(1, 48.0, 11.0)];

        let mut fired = Vec::new();
        for distance in [600.0, 300.0, 50.0, 300.0, 600.0] {
            let lat = north_of(48.0, distance);
            for event in detector.evaluate(7, "bus-1", &stop, lat, 11.0) {
                fired.push(event.action);
            }
        }

        assert_eq!(
            fired,
            vec![
                GeofenceAction::Approaching,
                GeofenceAction::Arrived,
                GeofenceAction::Departed
            ]
        );
    }

    #[test]
    fn no_event_within_same_band() {
        let (detector, _rx) = detector();
        let stop = vec![stop_at(1, 48.0, 11.0)];

        detector.evaluate(7, "bus-1", &stop, north_of(48.0, 400.0), 11.0);
        let again = detector.evaluate(7, "bus-1", &stop, north_of(48.0, 350.0), 11.0);
        assert!(again.is_empty());
    }

    #[test]
    fn direct_arrival_from_outside_emits_arrived_only() {
        let (detector, _rx) = detector();
        let stop = vec![stop_at(1, 48.0, 11.0)];

        let events = detector.evaluate(7, "bus-1", &stop, north_of(48.0, 50.0), 11.0);
        let actions: Vec<_> = events.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![GeofenceAction::Arrived]);
    }

    #[test]
    fn leaving_approach_band_without_arrival_is_silent() {
        let (detector, _rx) = detector();
        let stop = vec![stop_at(1, 48.0, 11.0)];

        detector.evaluate(7, "bus-1", &stop, north_of(48.0, 300.0), 11.0);
        let events = detector.evaluate(7, "bus-1", &stop, north_of(48.0, 900.0), 11.0);
        assert!(events.is_empty());
    }

    #[test]
    fn arrival_and_departure_queue_boarding_commands() {
        let (detector, mut rx) = detector();
        let stop = vec![stop_at(3, 48.0, 11.0)];

        detector.evaluate(7, "bus-1", &stop, north_of(48.0, 50.0), 11.0);
        detector.evaluate(7, "bus-1", &stop, north_of(48.0, 900.0), 11.0);

        match rx.try_recv().unwrap() {
            BoardingCommand::Board { trip_id, stop_id, .. } => {
                assert_eq!((trip_id, stop_id), (7, 3));
            }
            other => panic!("expected board, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            BoardingCommand::Alight { trip_id, stop_id, .. } => {
                assert_eq!((trip_id, stop_id), (7, 3));
            }
            other => panic!("expected alight, got {other:?}"),
        }
    }

    #[test]
    fn every_stop_on_route_is_evaluated() {
        let (detector, _rx) = detector();
        // Two stops ~200 m apart; the vehicle sits on the second one.
        let stops = vec![stop_at(1, 48.0, 11.0), stop_at(2, north_of(48.0, 200.0), 11.0)];

        let events = detector.evaluate(7, "bus-1", &stops, north_of(48.0, 200.0), 11.0);
        let actions: Vec<_> = events.iter().map(|e| (e.stop_id, e.action)).collect();
        assert_eq!(
            actions,
            vec![
                (1, GeofenceAction::Approaching),
                (2, GeofenceAction::Arrived)
            ]
        );
    }

    #[test]
    fn vehicles_do_not_share_geofence_state() {
        let (detector, _rx) = detector();
        let stop = vec![stop_at(1, 48.0, 11.0)];

        detector.evaluate(7, "bus-1", &stop, north_of(48.0, 300.0), 11.0);
        let events = detector.evaluate(7, "bus-2", &stop, north_of(48.0, 300.0), 11.0);
        assert_eq!(events.len(), 1, "bus-2 starts from outside independently");
    }
}
