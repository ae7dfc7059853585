//! Trip lifecycle.
//!
//! ```text
//! searching ⇄ offering → assigned → driver_enroute → trip_active → completed
//!     │           │          │              │               │
//!     └───────────┴──────────┴──────────────┴───────────────┴──→ cancelled
//! searching → no_match
//! searching | offering | assigned → expired
//! ```
//!
//! Trips live in the active map until they reach a terminal state, then move to a
//! bounded archive so late lookups (duplicate accepts, repeated cancels) still
//! resolve. A trip is written to the archive before it leaves the active map.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, ONE_MIN_MS};
use crate::error::{LockError, NoMatchReason, TripError};
use crate::geo_index::GeoIndex;
use crate::lease::AssignmentLock;
use crate::model::{Availability, DriverId, GeoPoint, RiderId, TripId, VehicleClass};
use crate::persistence::{persist_in_background, TripPersistence};
use crate::pricing::{CancellationPolicy, CancellationStage, FareEstimator, FareQuote};
use crate::retry::RetryPolicy;
use crate::spatial::haversine_km;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripState {
    Searching,
    Offering,
    Assigned,
    DriverEnroute,
    TripActive,
    Completed,
    Cancelled,
    Expired,
    NoMatch,
}

impl TripState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripState::Completed | TripState::Cancelled | TripState::Expired | TripState::NoMatch
        )
    }

    pub fn can_transition_to(self, next: TripState) -> bool {
        use TripState::*;
        matches!(
            (self, next),
            (Searching, Offering)
                | (Searching, NoMatch)
                | (Offering, Searching)
                | (Offering, Assigned)
                | (Assigned, DriverEnroute)
                | (DriverEnroute, TripActive)
                | (TripActive, Completed)
                | (Searching | Offering | Assigned, Expired)
                | (Searching | Offering | Assigned | DriverEnroute | TripActive, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripRequest {
    pub rider_id: RiderId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: VehicleClass,
}

/// Actual distance and duration reported at drop-off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripMetrics {
    pub distance_km: f64,
    pub duration_min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: TripId,
    pub rider_id: RiderId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: VehicleClass,
    pub state: TripState,
    pub requested_at_ms: u64,
    /// Quote shown to the rider; its surge multiplier is locked for the trip.
    pub quote: FareQuote,
    pub driver_id: Option<DriverId>,
    pub escalation_round: u32,
    pub assigned_at_ms: Option<u64>,
    pub enroute_at_ms: Option<u64>,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    /// Distance covered by the driver since the rider was picked up.
    pub tracked_distance_km: f64,
    pub last_driver_position: Option<GeoPoint>,
    pub final_fare: Option<f64>,
    pub cancellation_fee: Option<f64>,
    pub no_match_reason: Option<NoMatchReason>,
}

impl Trip {
    pub fn time_to_match_ms(&self) -> Option<u64> {
        self.assigned_at_ms
            .map(|at| at.saturating_sub(self.requested_at_ms))
    }
}

/// Result of a cancel request. Repeated cancels report the first outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancelOutcome {
    Cancelled {
        fee: f64,
        driver_id: Option<DriverId>,
    },
    AlreadyCancelled {
        fee: f64,
    },
    AlreadyTerminal(TripState),
}

impl CancelOutcome {
    pub fn fee(&self) -> f64 {
        match self {
            CancelOutcome::Cancelled { fee, .. } | CancelOutcome::AlreadyCancelled { fee } => *fee,
            CancelOutcome::AlreadyTerminal(_) => 0.0,
        }
    }
}

pub struct TripStateMachine {
    active: DashMap<TripId, Trip>,
    archive: Mutex<LruCache<TripId, Trip>>,
    by_driver: DashMap<DriverId, TripId>,
    next_id: AtomicU64,
    lock: AssignmentLock,
    geo: Arc<GeoIndex>,
    fares: Arc<FareEstimator>,
    policy: CancellationPolicy,
    persistence: Arc<dyn TripPersistence>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl TripStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lock: AssignmentLock,
        geo: Arc<GeoIndex>,
        fares: Arc<FareEstimator>,
        policy: CancellationPolicy,
        persistence: Arc<dyn TripPersistence>,
        retry: RetryPolicy,
        archive_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(archive_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            active: DashMap::new(),
            archive: Mutex::new(LruCache::new(capacity)),
            by_driver: DashMap::new(),
            next_id: AtomicU64::new(1),
            lock,
            geo,
            fares,
            policy,
            persistence,
            retry,
            clock,
        }
    }

    /// Create a trip in `searching`.
    pub fn open(&self, request: TripRequest, quote: FareQuote) -> Trip {
        let trip_id = TripId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let trip = Trip {
            trip_id,
            rider_id: request.rider_id,
            pickup: request.pickup,
            dropoff: request.dropoff,
            vehicle_class: request.vehicle_class,
            state: TripState::Searching,
            requested_at_ms: self.clock.now_ms(),
            quote,
            driver_id: None,
            escalation_round: 0,
            assigned_at_ms: None,
            enroute_at_ms: None,
            started_at_ms: None,
            ended_at_ms: None,
            tracked_distance_km: 0.0,
            last_driver_position: None,
            final_fare: None,
            cancellation_fee: None,
            no_match_reason: None,
        };
        self.active.insert(trip_id, trip.clone());
        trip
    }

    /// Active or archived trip.
    pub fn get(&self, trip_id: TripId) -> Option<Trip> {
        if let Some(trip) = self.active.get(&trip_id) {
            return Some(trip.clone());
        }
        self.archive.lock().get(&trip_id).cloned()
    }

    pub fn state(&self, trip_id: TripId) -> Option<TripState> {
        self.get(trip_id).map(|t| t.state)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Trip currently bound to `driver_id` (assigned through trip_active).
    pub fn trip_for_driver(&self, driver_id: DriverId) -> Option<TripId> {
        self.by_driver.get(&driver_id).map(|t| *t)
    }

    /// `(trip, driver)` pairs of trips in `assigned`.
    pub fn assigned_trips(&self) -> Vec<(TripId, DriverId)> {
        self.active
            .iter()
            .filter(|t| t.state == TripState::Assigned)
            .filter_map(|t| t.driver_id.map(|d| (t.trip_id, d)))
            .collect()
    }

    pub fn begin_offering(&self, trip_id: TripId, round: u32) -> Result<Trip, TripError> {
        self.transition(trip_id, TripState::Offering, |trip, _| {
            trip.escalation_round = round;
        })
    }

    /// Back to `searching` between escalation rounds.
    pub fn resume_search(&self, trip_id: TripId) -> Result<Trip, TripError> {
        self.transition(trip_id, TripState::Searching, |_, _| {})
    }

    /// Bind the trip to the driver holding its lease and mark the driver `on_trip`.
    pub fn assign(&self, trip_id: TripId, driver_id: DriverId) -> Result<Trip, TripError> {
        let trip = self.transition(trip_id, TripState::Assigned, |trip, now_ms| {
            trip.driver_id = Some(driver_id);
            trip.assigned_at_ms = Some(now_ms);
        })?;
        self.by_driver.insert(driver_id, trip_id);
        self.geo.set_availability(driver_id, Availability::OnTrip);
        info!(%trip_id, %driver_id, round = trip.escalation_round, "trip assigned");
        Ok(trip)
    }

    pub fn mark_enroute(&self, trip_id: TripId) -> Result<Trip, TripError> {
        self.transition(trip_id, TripState::DriverEnroute, |trip, now_ms| {
            trip.enroute_at_ms = Some(now_ms);
        })
    }

    /// Rider picked up.
    pub fn start_trip(&self, trip_id: TripId) -> Result<Trip, TripError> {
        self.transition(trip_id, TripState::TripActive, |trip, now_ms| {
            trip.started_at_ms = Some(now_ms);
        })
    }

    /// Record a driver position for a bound trip. Distance only accumulates while
    /// the rider is on board.
    pub fn record_progress(&self, trip_id: TripId, point: GeoPoint) -> Result<Trip, TripError> {
        let mut trip = self
            .active
            .get_mut(&trip_id)
            .ok_or(TripError::UnknownTrip(trip_id))?;
        if trip.state == TripState::TripActive {
            if let Some(last) = trip.last_driver_position {
                trip.tracked_distance_km += haversine_km(last, point);
            }
        }
        trip.last_driver_position = Some(point);
        Ok(trip.clone())
    }

    /// Drop-off. The final fare uses the caller's measured distance and duration at
    /// the quote's surge; the lease is released whatever its state.
    pub async fn complete(&self, trip_id: TripId, metrics: TripMetrics) -> Result<Trip, TripError> {
        let trip = self.transition(trip_id, TripState::Completed, |trip, now_ms| {
            trip.ended_at_ms = Some(now_ms);
            trip.final_fare = Some(self.fares.fare_for(
                trip.vehicle_class,
                metrics.distance_km,
                metrics.duration_min,
                trip.quote.surge_multiplier,
            ));
        })?;
        let driver_id = trip.driver_id.ok_or(TripError::NoDriver { trip: trip_id })?;
        info!(%trip_id, %driver_id, fare = ?trip.final_fare, "trip completed");
        self.release_driver(trip_id, driver_id).await;
        Ok(trip)
    }

    /// Cancel from any non-terminal state. Idempotent: a second cancel reports the
    /// fee charged by the first.
    pub async fn cancel(&self, trip_id: TripId) -> Result<CancelOutcome, TripError> {
        let now_ms = self.clock.now_ms();
        let cancelled = match self.active.entry(trip_id) {
            Entry::Occupied(mut occupied) => {
                let trip = occupied.get_mut();
                if trip.state.is_terminal() {
                    return Ok(Self::settled_cancel(trip));
                }
                let fee = self.policy.fee(self.cancellation_stage(trip, now_ms), now_ms);
                trip.state = TripState::Cancelled;
                trip.ended_at_ms = Some(now_ms);
                trip.cancellation_fee = Some(fee);
                let trip = trip.clone();
                self.archive.lock().put(trip_id, trip.clone());
                occupied.remove();
                trip
            }
            Entry::Vacant(_) => {
                let archived = self.archive.lock().get(&trip_id).cloned();
                return match archived {
                    Some(trip) => Ok(Self::settled_cancel(&trip)),
                    None => Err(TripError::UnknownTrip(trip_id)),
                };
            }
        };

        let fee = cancelled.cancellation_fee.unwrap_or(0.0);
        info!(%trip_id, fee, "trip cancelled");
        if let Some(driver_id) = cancelled.driver_id {
            self.release_driver(trip_id, driver_id).await;
        }
        persist_in_background(self.persistence.clone(), cancelled.clone(), self.retry.clone());
        Ok(CancelOutcome::Cancelled {
            fee,
            driver_id: cancelled.driver_id,
        })
    }

    pub fn no_match(&self, trip_id: TripId, reason: NoMatchReason) -> Result<Trip, TripError> {
        self.transition(trip_id, TripState::NoMatch, |trip, now_ms| {
            trip.ended_at_ms = Some(now_ms);
            trip.no_match_reason = Some(reason);
        })
    }

    /// Expire a trip whose driver stopped holding the lease. Frees the driver.
    pub async fn expire(&self, trip_id: TripId) -> Result<Trip, TripError> {
        let trip = self.transition(trip_id, TripState::Expired, |trip, now_ms| {
            trip.ended_at_ms = Some(now_ms);
        })?;
        if let Some(driver_id) = trip.driver_id {
            self.release_driver(trip_id, driver_id).await;
        }
        Ok(trip)
    }

    fn cancellation_stage(&self, trip: &Trip, now_ms: u64) -> CancellationStage {
        match (trip.state, trip.assigned_at_ms, trip.started_at_ms) {
            (TripState::TripActive, _, Some(started_at_ms)) => {
                let minutes = now_ms.saturating_sub(started_at_ms) as f64 / ONE_MIN_MS as f64;
                CancellationStage::InTrip {
                    partial_fare: self.fares.fare_for(
                        trip.vehicle_class,
                        trip.tracked_distance_km,
                        minutes,
                        trip.quote.surge_multiplier,
                    ),
                }
            }
            (TripState::Assigned | TripState::DriverEnroute, Some(assigned_at_ms), _) => {
                CancellationStage::Assigned { assigned_at_ms }
            }
            _ => CancellationStage::BeforeAssignment,
        }
    }

    fn settled_cancel(trip: &Trip) -> CancelOutcome {
        match trip.state {
            TripState::Cancelled => CancelOutcome::AlreadyCancelled {
                fee: trip.cancellation_fee.unwrap_or(0.0),
            },
            state => CancelOutcome::AlreadyTerminal(state),
        }
    }

    /// Give the driver back to the pool and drop the trip's lease. Release failures
    /// are tolerated; the lease lapses on its own.
    async fn release_driver(&self, trip_id: TripId, driver_id: DriverId) {
        self.by_driver.remove_if(&driver_id, |_, bound| *bound == trip_id);
        self.geo.compare_and_set_availability(
            driver_id,
            Availability::OnTrip,
            Availability::OnlineIdle,
        );
        match self.lock.release(driver_id, trip_id).await {
            Ok(_) => {}
            Err(LockError::Timeout { .. }) => {
                warn!(%trip_id, %driver_id, "lease release timed out, leaving it to expire")
            }
            Err(err) => error!(%trip_id, %driver_id, error = %err, "lease release failed"),
        }
    }

    /// Apply a checked transition. Terminal trips are archived, unbound from their
    /// driver and handed to persistence.
    fn transition(
        &self,
        trip_id: TripId,
        to: TripState,
        apply: impl FnOnce(&mut Trip, u64),
    ) -> Result<Trip, TripError> {
        let now_ms = self.clock.now_ms();
        let Entry::Occupied(mut occupied) = self.active.entry(trip_id) else {
            let from = self.archive.lock().get(&trip_id).map(|t| t.state);
            return Err(match from {
                Some(from) => TripError::InvalidTransition {
                    trip: trip_id,
                    from,
                    to,
                },
                None => TripError::UnknownTrip(trip_id),
            });
        };

        let trip = occupied.get_mut();
        if !trip.state.can_transition_to(to) {
            return Err(TripError::InvalidTransition {
                trip: trip_id,
                from: trip.state,
                to,
            });
        }
        debug!(%trip_id, from = ?trip.state, ?to, "trip transition");
        trip.state = to;
        apply(trip, now_ms);
        let snapshot = trip.clone();

        if to.is_terminal() {
            self.archive.lock().put(trip_id, snapshot.clone());
            occupied.remove();
            persist_in_background(self.persistence.clone(), snapshot.clone(), self.retry.clone());
        }
        Ok(snapshot)
    }
}
