//! Per-trip matching task: candidate search, offer broadcast, first-accept-wins
//! resolution and radius escalation.
//!
//! Round structure:
//!
//! 1. `searching`: query the index for the next K drivers beyond the tried set.
//!    Nothing found ends the trip in `no_match`.
//! 2. `offering`: push offers, then wait on the inbox until the round deadline.
//!    An accept goes to the lease; the first acquire wins and the other pending
//!    offers are superseded. A lost acquire only disqualifies that driver.
//! 3. Deadline without a winner: expire the round's offers, return to
//!    `searching` and start the next round. A lease store outage withdraws the
//!    round's offers instead, so those drivers can be offered again.
//!
//! Rounds are bounded by `max_escalation_rounds` and the total search budget.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::engine::MatchingEngine;
use super::offer::{Offer, OfferBook, OfferStatus};
use super::types::{estimate_pickup_eta_ms, MatchCandidate, MatchOutcome, ResponseOutcome, TripCommand};
use crate::channel::OfferResult;
use crate::error::{ChannelError, GeoIndexError, LockError, NoMatchReason};
use crate::model::{Availability, DriverId, TripId};
use crate::retry::retry_with_backoff;
use crate::surge::GeoCell;
use crate::telemetry::DispatchTelemetry;
use crate::trip::Trip;

/// How one offer round ended.
#[derive(Debug, Clone, Copy, PartialEq)]
enum RoundResult {
    Assigned { driver_id: DriverId, pickup_eta_ms: u64 },
    Expired,
    Cancelled,
    /// The lease store became unreachable mid-round.
    StorageDown,
}

impl MatchingEngine {
    pub(super) async fn run_trip(
        self: Arc<Self>,
        trip: Trip,
        surge_cell: GeoCell,
        inbox: mpsc::Receiver<TripCommand>,
        outcome_tx: oneshot::Sender<MatchOutcome>,
    ) {
        let trip_id = trip.trip_id;
        let outcome = self.search(&trip, inbox).await;

        self.inboxes.remove(&trip_id);
        self.surge.demand_closed(surge_cell);

        match outcome {
            MatchOutcome::Assigned { .. } => {
                DispatchTelemetry::incr(&self.telemetry.trips_assigned);
                let latency_ms = self
                    .trips
                    .get(trip_id)
                    .and_then(|t| t.time_to_match_ms())
                    .unwrap_or(0);
                DispatchTelemetry::add(&self.telemetry.match_latency_ms_total, latency_ms);
            }
            MatchOutcome::NoMatch { reason } => {
                DispatchTelemetry::incr(&self.telemetry.trips_no_match);
                debug!(%reason, "no match");
                self.notify(trip_id, OfferResult::NoMatch { reason });
            }
            MatchOutcome::Cancelled => debug!("matching stopped, trip cancelled"),
        }
        // The requester may have stopped waiting.
        let _ = outcome_tx.send(outcome);
    }

    async fn search(&self, trip: &Trip, mut inbox: mpsc::Receiver<TripCommand>) -> MatchOutcome {
        let trip_id = trip.trip_id;
        let search_deadline = Instant::now() + self.config.max_search_duration();
        let mut book = OfferBook::default();
        let mut round = 0;

        let outcome = loop {
            if self.trips.state(trip_id).map_or(true, |s| s.is_terminal()) {
                break MatchOutcome::Cancelled;
            }
            if Instant::now() >= search_deadline {
                break self.give_up(trip_id, NoMatchReason::SearchTimeout);
            }
            if round >= self.config.max_escalation_rounds {
                break self.give_up(trip_id, NoMatchReason::EscalationExhausted);
            }

            let candidates = match self.find_candidates(trip, &book.tried()) {
                Ok(candidates) => candidates,
                Err(err) => {
                    error!(error = %err, "candidate query failed");
                    break self.give_up(trip_id, NoMatchReason::SystemError);
                }
            };
            if candidates.is_empty() {
                let reason = if book.is_empty() {
                    NoMatchReason::NoDriversAvailable
                } else {
                    NoMatchReason::EscalationExhausted
                };
                break self.give_up(trip_id, reason);
            }

            round += 1;
            if self.trips.begin_offering(trip_id, round).is_err() {
                break MatchOutcome::Cancelled;
            }
            let round_deadline = (Instant::now() + self.config.offer_ttl()).min(search_deadline);
            let expires_at_ms = self.clock.now_ms()
                + round_deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64;
            debug!(round, candidates = candidates.len(), "offer round");

            let delivered = self
                .broadcast(trip, round, candidates, expires_at_ms, &mut book)
                .await;
            let result = if delivered == 0 {
                RoundResult::Expired
            } else {
                self.await_round(trip, round_deadline, &mut inbox, &mut book)
                    .await
            };

            match result {
                RoundResult::Assigned {
                    driver_id,
                    pickup_eta_ms,
                } => {
                    break MatchOutcome::Assigned {
                        driver_id,
                        pickup_eta_ms,
                        round,
                    }
                }
                RoundResult::Cancelled => break MatchOutcome::Cancelled,
                RoundResult::Expired => {
                    self.expire_round(trip_id, &mut book);
                    if self.trips.resume_search(trip_id).is_err() {
                        break MatchOutcome::Cancelled;
                    }
                }
                RoundResult::StorageDown => {
                    self.withdraw_round(trip_id, &mut book);
                    if self.trips.resume_search(trip_id).is_err() {
                        break MatchOutcome::Cancelled;
                    }
                    if !self.await_store_recovery().await {
                        break self.give_up(trip_id, NoMatchReason::SystemError);
                    }
                }
            }
        };

        self.release_leases_in_doubt(trip_id, &book).await;
        if self.config.exclusive_offers {
            self.release_offered_drivers(&book);
        }
        outcome
    }

    fn give_up(&self, trip_id: TripId, reason: NoMatchReason) -> MatchOutcome {
        match self.trips.no_match(trip_id, reason) {
            Ok(_) => MatchOutcome::NoMatch { reason },
            // Cancelled concurrently.
            Err(_) => MatchOutcome::Cancelled,
        }
    }

    fn find_candidates(
        &self,
        trip: &Trip,
        tried: &HashSet<DriverId>,
    ) -> Result<Vec<MatchCandidate>, GeoIndexError> {
        let found = self.geo.query_nearby_excluding(
            trip.pickup,
            trip.vehicle_class,
            self.config.candidate_fan_out,
            self.config.max_radius_km(),
            tried,
        )?;
        let speed_kmh = self
            .config
            .speed_profile
            .speed_at(self.clock.now_ms(), self.config.utc_offset_minutes);
        Ok(found
            .into_iter()
            .map(|c| MatchCandidate {
                driver_id: c.driver_id,
                position: c.position,
                pickup_distance_km: c.distance_km,
                pickup_eta_ms: estimate_pickup_eta_ms(c.distance_km, speed_kmh),
            })
            .collect())
    }

    /// Push offers concurrently. Returns how many were delivered; undeliverable
    /// drivers are skipped for the rest of the trip.
    async fn broadcast(
        &self,
        trip: &Trip,
        round: u32,
        candidates: Vec<MatchCandidate>,
        expires_at_ms: u64,
        book: &mut OfferBook,
    ) -> usize {
        let mut sends = JoinSet::new();
        for candidate in candidates {
            let driver_id = candidate.driver_id;
            if self.config.exclusive_offers
                && !self.geo.compare_and_set_availability(
                    driver_id,
                    Availability::OnlineIdle,
                    Availability::OfferPending,
                )
            {
                // Claimed by another trip since the query.
                book.skip(driver_id);
                continue;
            }
            let offer = Offer {
                trip_id: trip.trip_id,
                driver_id,
                round,
                pickup: trip.pickup,
                dropoff: trip.dropoff,
                vehicle_class: trip.vehicle_class,
                quote: trip.quote,
                pickup_distance_km: candidate.pickup_distance_km,
                pickup_eta_ms: candidate.pickup_eta_ms,
                expires_at_ms,
            };
            if !book.insert(offer.clone()) {
                continue;
            }

            let channel = self.channel.clone();
            let policy = self.config.retry.clone();
            let timeout = self.config.transport_timeout();
            sends.spawn(async move {
                let (channel, offer) = (&channel, &offer);
                let sent = retry_with_backoff(&policy, "send_offer", ChannelError::is_transient, || async move {
                    match tokio::time::timeout(timeout, channel.send_offer(offer.driver_id, offer)).await {
                        Ok(result) => result,
                        Err(_) => Err(ChannelError::Timeout),
                    }
                })
                .await;
                (offer.driver_id, sent)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {
                    delivered += 1;
                    DispatchTelemetry::incr(&self.telemetry.offers_sent);
                }
                Ok((driver_id, Err((err, attempts)))) => {
                    DispatchTelemetry::incr(&self.telemetry.transport_failures);
                    warn!(%driver_id, attempts, error = %err, "offer undeliverable, skipping driver");
                    book.mark(driver_id, OfferStatus::Unreachable);
                    self.release_offered_driver(driver_id);
                }
                Err(err) => warn!(error = %err, "offer send task failed"),
            }
        }
        delivered
    }

    async fn await_round(
        &self,
        trip: &Trip,
        deadline: Instant,
        inbox: &mut mpsc::Receiver<TripCommand>,
        book: &mut OfferBook,
    ) -> RoundResult {
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(TripCommand::Accept { driver_id, reply }) => {
                        let (response, settled) = self.resolve_accept(trip, driver_id, book).await;
                        let _ = reply.send(response);
                        if let Some(result) = settled {
                            return result;
                        }
                    }
                    Some(TripCommand::Decline { driver_id, reply }) => {
                        let response = book.decline(driver_id);
                        if response == ResponseOutcome::Declined {
                            debug!(%driver_id, "offer declined");
                            self.release_offered_driver(driver_id);
                        }
                        let _ = reply.send(response);
                    }
                    Some(TripCommand::Cancel) | None => return RoundResult::Cancelled,
                },
                _ = &mut expiry => return RoundResult::Expired,
            }
        }
    }

    /// Run one accept through the lease. The second value ends the round.
    async fn resolve_accept(
        &self,
        trip: &Trip,
        driver_id: DriverId,
        book: &mut OfferBook,
    ) -> (ResponseOutcome, Option<RoundResult>) {
        let trip_id = trip.trip_id;
        if let Err(response) = book.check_accept(driver_id, self.clock.now_ms()) {
            debug!(%driver_id, ?response, "accept not eligible");
            return (response, None);
        }

        let ttl = std::time::Duration::from_millis(self.config.lease_ttl_ms);
        let lock = &self.lock;
        let acquired = retry_with_backoff(
            &self.config.retry,
            "lease_acquire",
            |err: &LockError| matches!(err, LockError::Timeout { .. }),
            || lock.try_acquire(driver_id, trip_id, ttl),
        )
        .await;

        match acquired {
            Ok(true) => {
                if let Err(err) = self.trips.assign(trip_id, driver_id) {
                    // Cancelled while the lease call was in flight.
                    debug!(%driver_id, error = %err, "lease won for a closed trip, releasing");
                    if let Err(err) = self.lock.release(driver_id, trip_id).await {
                        warn!(%driver_id, error = %err, "release after closed trip failed");
                    }
                    return (ResponseOutcome::TripClosed, Some(RoundResult::Cancelled));
                }
                let pickup_eta_ms = book
                    .offer(driver_id)
                    .map(|o| o.pickup_eta_ms)
                    .unwrap_or_default();
                for sibling in book.settle(driver_id) {
                    self.release_offered_driver(sibling);
                    self.notify(trip_id, OfferResult::Superseded { driver_id: sibling });
                }
                self.notify(
                    trip_id,
                    OfferResult::Assigned {
                        driver_id,
                        pickup_eta_ms,
                    },
                );
                (
                    ResponseOutcome::Assigned {
                        trip_id,
                        pickup_eta_ms,
                    },
                    Some(RoundResult::Assigned {
                        driver_id,
                        pickup_eta_ms,
                    }),
                )
            }
            Ok(false) => {
                DispatchTelemetry::incr(&self.telemetry.lease_contentions);
                debug!(%driver_id, "lease contention, waiting for other responses");
                book.mark(driver_id, OfferStatus::Contended);
                self.release_offered_driver(driver_id);
                (ResponseOutcome::LeaseContention, None)
            }
            Err((LockError::Timeout { .. }, attempts)) => {
                DispatchTelemetry::incr(&self.telemetry.transport_failures);
                warn!(%driver_id, attempts, "lease acquire timed out, skipping driver");
                book.mark(driver_id, OfferStatus::Unreachable);
                book.mark_lease_in_doubt(driver_id);
                // A timed-out write may still have landed.
                if let Err(err) = self.lock.release(driver_id, trip_id).await {
                    debug!(%driver_id, error = %err, "release after timed-out acquire failed");
                }
                self.release_offered_driver(driver_id);
                (ResponseOutcome::TransportTimeout, None)
            }
            Err((err, _)) => {
                DispatchTelemetry::incr(&self.telemetry.storage_failures);
                error!(%driver_id, error = %err, "lease store unavailable");
                book.mark_lease_in_doubt(driver_id);
                (ResponseOutcome::Unavailable, Some(RoundResult::StorageDown))
            }
        }
    }

    fn expire_round(&self, trip_id: TripId, book: &mut OfferBook) {
        for driver_id in book.expire_pending() {
            DispatchTelemetry::incr(&self.telemetry.offers_expired);
            self.release_offered_driver(driver_id);
            self.notify(trip_id, OfferResult::Expired { driver_id });
        }
    }

    /// Pull the round's unanswered offers. The drivers stay eligible for later
    /// rounds since the outage, not the driver, ended the round.
    fn withdraw_round(&self, trip_id: TripId, book: &mut OfferBook) {
        for driver_id in book.withdraw_pending() {
            self.release_offered_driver(driver_id);
            self.notify(trip_id, OfferResult::Expired { driver_id });
        }
    }

    /// Best-effort release of leases this trip may hold on drivers it did not win.
    /// Release is compare-and-delete, so a lease another trip holds is untouched.
    async fn release_leases_in_doubt(&self, trip_id: TripId, book: &OfferBook) {
        for driver_id in book.leases_in_doubt() {
            match self.lock.release(driver_id, trip_id).await {
                Ok(true) => info!(%driver_id, "released lease left by a failed acquire"),
                Ok(false) => {}
                Err(err) => warn!(%driver_id, error = %err, "stray lease left to expire"),
            }
        }
    }

    /// Probe the lease store with backoff for up to the storage grace period.
    async fn await_store_recovery(&self) -> bool {
        let give_up_at = Instant::now() + self.config.storage_failure_grace();
        let mut attempt = 0;
        loop {
            match self.lock.ping().await {
                Ok(()) => {
                    info!("lease store reachable again, resuming search");
                    return true;
                }
                Err(err) => debug!(attempt, error = %err, "lease store still unreachable"),
            }
            let now = Instant::now();
            if now >= give_up_at {
                error!("lease store unreachable beyond grace period");
                return false;
            }
            let delay = self.config.retry.backoff_delay(attempt);
            attempt += 1;
            tokio::time::sleep_until((now + delay).min(give_up_at)).await;
        }
    }

    /// Undo `offer_pending` for one driver when offers are exclusive.
    fn release_offered_driver(&self, driver_id: DriverId) {
        if self.config.exclusive_offers {
            self.geo.compare_and_set_availability(
                driver_id,
                Availability::OfferPending,
                Availability::OnlineIdle,
            );
        }
    }

    fn release_offered_drivers(&self, book: &OfferBook) {
        for driver_id in book.offered_drivers() {
            if book.status(driver_id) != Some(OfferStatus::Won) {
                self.release_offered_driver(driver_id);
            }
        }
    }
}
