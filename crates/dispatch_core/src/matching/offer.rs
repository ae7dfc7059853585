//! Offers of one trip and their resolution.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::types::ResponseOutcome;
use crate::model::{DriverId, GeoPoint, TripId, VehicleClass};
use crate::pricing::FareQuote;

/// What a driver is shown. Valid until `expires_at_ms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    pub trip_id: TripId,
    pub driver_id: DriverId,
    pub round: u32,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: VehicleClass,
    pub quote: FareQuote,
    pub pickup_distance_km: f64,
    pub pickup_eta_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    Pending,
    Declined,
    /// The driver's lease belonged to another trip when they accepted.
    Contended,
    /// Offer delivery or the lease call kept timing out.
    Unreachable,
    Expired,
    Won,
    Superseded,
}

/// All offers of one trip, at most one per driver. Owned by the trip's matching
/// task, so it needs no locking.
#[derive(Debug, Default)]
pub struct OfferBook {
    offers: HashMap<DriverId, (Offer, OfferStatus)>,
    /// Drivers passed over without an offer (e.g. claimed by another trip).
    skipped: HashSet<DriverId>,
    /// Drivers whose lease write failed without an answer; it may have landed.
    lease_in_doubt: HashSet<DriverId>,
}

impl OfferBook {
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty() && self.skipped.is_empty()
    }

    /// Every driver this trip has already offered or passed over.
    pub fn tried(&self) -> HashSet<DriverId> {
        self.offers
            .keys()
            .chain(self.skipped.iter())
            .copied()
            .collect()
    }

    /// Register a pending offer. Returns `false` if the driver already had one.
    pub fn insert(&mut self, offer: Offer) -> bool {
        if self.offers.contains_key(&offer.driver_id) {
            return false;
        }
        self.offers
            .insert(offer.driver_id, (offer, OfferStatus::Pending));
        true
    }

    pub fn skip(&mut self, driver_id: DriverId) {
        self.skipped.insert(driver_id);
    }

    pub fn status(&self, driver_id: DriverId) -> Option<OfferStatus> {
        self.offers.get(&driver_id).map(|(_, status)| *status)
    }

    pub fn offer(&self, driver_id: DriverId) -> Option<&Offer> {
        self.offers.get(&driver_id).map(|(offer, _)| offer)
    }

    /// Set the status of a still-pending offer.
    pub fn mark(&mut self, driver_id: DriverId, status: OfferStatus) {
        if let Some((_, current)) = self.offers.get_mut(&driver_id) {
            if *current == OfferStatus::Pending {
                *current = status;
            }
        }
    }

    /// Whether an accept from `driver_id` may go to the lease. `Err` carries the
    /// answer for the driver otherwise.
    pub fn check_accept(&self, driver_id: DriverId, now_ms: u64) -> Result<(), ResponseOutcome> {
        let Some((offer, status)) = self.offers.get(&driver_id) else {
            return Err(ResponseOutcome::NotOffered);
        };
        match status {
            OfferStatus::Pending if now_ms > offer.expires_at_ms => Err(ResponseOutcome::OfferExpired),
            OfferStatus::Pending => Ok(()),
            OfferStatus::Declined => Err(ResponseOutcome::Declined),
            OfferStatus::Contended => Err(ResponseOutcome::LeaseContention),
            OfferStatus::Unreachable => Err(ResponseOutcome::TransportTimeout),
            OfferStatus::Expired => Err(ResponseOutcome::OfferExpired),
            OfferStatus::Won => Err(ResponseOutcome::AlreadyAssigned),
            OfferStatus::Superseded => Err(ResponseOutcome::OfferSuperseded),
        }
    }

    pub fn decline(&mut self, driver_id: DriverId) -> ResponseOutcome {
        match self.status(driver_id) {
            None => ResponseOutcome::NotOffered,
            Some(OfferStatus::Pending) => {
                self.mark(driver_id, OfferStatus::Declined);
                ResponseOutcome::Declined
            }
            Some(OfferStatus::Won) => ResponseOutcome::AlreadyAssigned,
            Some(OfferStatus::Superseded) => ResponseOutcome::OfferSuperseded,
            Some(OfferStatus::Expired) => ResponseOutcome::OfferExpired,
            Some(_) => ResponseOutcome::Declined,
        }
    }

    pub fn mark_lease_in_doubt(&mut self, driver_id: DriverId) {
        self.lease_in_doubt.insert(driver_id);
    }

    /// Drivers this trip may hold a lease on without having won them.
    pub fn leases_in_doubt(&self) -> Vec<DriverId> {
        let mut drivers: Vec<DriverId> = self
            .lease_in_doubt
            .iter()
            .copied()
            .filter(|d| self.status(*d) != Some(OfferStatus::Won))
            .collect();
        drivers.sort();
        drivers
    }

    /// Drop every pending offer so those drivers can be offered again later.
    /// Returns the withdrawn drivers.
    pub fn withdraw_pending(&mut self) -> Vec<DriverId> {
        let mut drivers: Vec<DriverId> = self
            .offers
            .iter()
            .filter(|(_, (_, status))| *status == OfferStatus::Pending)
            .map(|(driver_id, _)| *driver_id)
            .collect();
        for driver_id in &drivers {
            self.offers.remove(driver_id);
        }
        drivers.sort();
        drivers
    }

    /// Expire every pending offer. Each driver is returned once over the book's life.
    pub fn expire_pending(&mut self) -> Vec<DriverId> {
        self.transition_pending(OfferStatus::Expired)
    }

    /// Record the winner and supersede every other pending offer. Each sibling is
    /// returned once.
    pub fn settle(&mut self, winner: DriverId) -> Vec<DriverId> {
        if let Some((_, status)) = self.offers.get_mut(&winner) {
            *status = OfferStatus::Won;
        }
        self.transition_pending(OfferStatus::Superseded)
    }

    fn transition_pending(&mut self, to: OfferStatus) -> Vec<DriverId> {
        let mut drivers: Vec<DriverId> = self
            .offers
            .iter_mut()
            .filter(|(_, (_, status))| *status == OfferStatus::Pending)
            .map(|(driver_id, (_, status))| {
                *status = to;
                *driver_id
            })
            .collect();
        drivers.sort();
        drivers
    }

    /// Every driver with an offer in this book.
    pub fn offered_drivers(&self) -> impl Iterator<Item = DriverId> + '_ {
        self.offers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RouteSource;

    fn offer(driver: u64, expires_at_ms: u64) -> Offer {
        let point = GeoPoint {
            lat: 37.7755,
            lon: -122.4180,
        };
        Offer {
            trip_id: TripId(1),
            driver_id: DriverId(driver),
            round: 1,
            pickup: point,
            dropoff: point,
            vehicle_class: VehicleClass::Economy,
            quote: FareQuote {
                vehicle_class: VehicleClass::Economy,
                distance_km: 1.0,
                duration_min: 3.0,
                surge_multiplier: 1.0,
                amount: 7.0,
                route_source: RouteSource::StraightLine,
            },
            pickup_distance_km: 0.1,
            pickup_eta_ms: 60_000,
            expires_at_ms,
        }
    }

    #[test]
    fn one_offer_per_driver() {
        let mut book = OfferBook::default();
        assert!(book.insert(offer(1, 100)));
        assert!(!book.insert(offer(1, 200)));
        assert_eq!(book.offer(DriverId(1)).map(|o| o.expires_at_ms), Some(100));
    }

    #[test]
    fn siblings_are_superseded_exactly_once() {
        let mut book = OfferBook::default();
        for driver in 1..=3 {
            book.insert(offer(driver, 100));
        }
        assert_eq!(book.settle(DriverId(2)), vec![DriverId(1), DriverId(3)]);
        assert!(book.settle(DriverId(2)).is_empty());
        assert!(book.expire_pending().is_empty());

        assert_eq!(book.check_accept(DriverId(2), 0), Err(ResponseOutcome::AlreadyAssigned));
        assert_eq!(book.check_accept(DriverId(1), 0), Err(ResponseOutcome::OfferSuperseded));
    }

    #[test]
    fn accept_checks_follow_offer_status() {
        let mut book = OfferBook::default();
        book.insert(offer(1, 100));
        book.insert(offer(2, 100));
        book.insert(offer(3, 100));

        assert_eq!(book.check_accept(DriverId(1), 100), Ok(()));
        assert_eq!(book.check_accept(DriverId(1), 101), Err(ResponseOutcome::OfferExpired));
        assert_eq!(book.check_accept(DriverId(9), 0), Err(ResponseOutcome::NotOffered));

        book.mark(DriverId(2), OfferStatus::Contended);
        assert_eq!(book.check_accept(DriverId(2), 0), Err(ResponseOutcome::LeaseContention));

        assert_eq!(book.decline(DriverId(3)), ResponseOutcome::Declined);
        assert_eq!(book.check_accept(DriverId(3), 0), Err(ResponseOutcome::Declined));

        assert_eq!(book.expire_pending(), vec![DriverId(1)]);
        assert_eq!(book.check_accept(DriverId(1), 0), Err(ResponseOutcome::OfferExpired));
    }

    #[test]
    fn tried_includes_skipped_drivers() {
        let mut book = OfferBook::default();
        assert!(book.is_empty());
        book.insert(offer(1, 100));
        book.skip(DriverId(5));
        let tried = book.tried();
        assert!(tried.contains(&DriverId(1)) && tried.contains(&DriverId(5)));
        assert!(!book.is_empty());
    }

    #[test]
    fn withdrawn_offers_leave_the_tried_set() {
        let mut book = OfferBook::default();
        book.insert(offer(1, 100));
        book.insert(offer(2, 100));
        book.decline(DriverId(2));

        assert_eq!(book.withdraw_pending(), vec![DriverId(1)]);
        assert!(!book.tried().contains(&DriverId(1)));
        assert!(book.tried().contains(&DriverId(2)));
        assert_eq!(book.check_accept(DriverId(1), 0), Err(ResponseOutcome::NotOffered));
        assert!(book.insert(offer(1, 200)));
    }

    #[test]
    fn leases_in_doubt_exclude_the_winner() {
        let mut book = OfferBook::default();
        book.insert(offer(1, 100));
        book.insert(offer(2, 100));
        book.mark_lease_in_doubt(DriverId(1));
        book.mark_lease_in_doubt(DriverId(2));
        book.settle(DriverId(2));
        assert_eq!(book.leases_in_doubt(), vec![DriverId(1)]);
    }
}
