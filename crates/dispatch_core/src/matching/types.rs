use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::NoMatchReason;
use crate::model::{DriverId, GeoPoint, TripId};
use crate::pricing::FareQuote;
use crate::routing::ROUTE_INFLATION;

/// A driver selected for an offer round, with pickup estimates.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub pickup_distance_km: f64,
    pub pickup_eta_ms: u64,
}

/// Pickup ETA from straight-line distance at `speed_kmh`, at least one second.
pub fn estimate_pickup_eta_ms(distance_km: f64, speed_kmh: f64) -> u64 {
    if speed_kmh <= 0.0 {
        return u64::MAX;
    }
    let eta_hours = distance_km.max(0.0) * ROUTE_INFLATION / speed_kmh;
    (eta_hours * 3600.0 * 1000.0).max(1000.0) as u64
}

/// How matching ended for a trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Assigned {
        driver_id: DriverId,
        pickup_eta_ms: u64,
        round: u32,
    },
    NoMatch {
        reason: NoMatchReason,
    },
    /// The rider cancelled before a driver was locked in.
    Cancelled,
}

/// Answer to a driver's accept or decline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// This accept won the trip.
    Assigned { trip_id: TripId, pickup_eta_ms: u64 },
    /// Duplicate accept from the driver that already won.
    AlreadyAssigned,
    /// Another driver won the trip.
    OfferSuperseded,
    /// The driver holds a lease for a different trip.
    LeaseContention,
    /// The offer's deadline passed.
    OfferExpired,
    /// No offer exists for this (trip, driver) pair.
    NotOffered,
    /// Decline acknowledged, or accept after a decline.
    Declined,
    /// The trip was cancelled or gave up before this response was handled.
    TripClosed,
    /// The lease store did not answer in time; the driver is skipped for this round.
    TransportTimeout,
    /// The lease store is unreachable.
    Unavailable,
}

/// Outcome of a trip request.
#[derive(Debug)]
pub struct TripTicket {
    pub trip_id: TripId,
    pub quote: FareQuote,
    /// Resolves once matching finishes.
    pub outcome: oneshot::Receiver<MatchOutcome>,
}

/// Messages into a trip's matching task.
#[derive(Debug)]
pub(crate) enum TripCommand {
    Accept {
        driver_id: DriverId,
        reply: oneshot::Sender<ResponseOutcome>,
    },
    Decline {
        driver_id: DriverId,
        reply: oneshot::Sender<ResponseOutcome>,
    },
    Cancel,
}
