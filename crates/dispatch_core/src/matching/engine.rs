//! Public face of the dispatch engine.
//!
//! Each trip request spawns one matching task (see `search.rs`) that owns the
//! trip's offers and inbox. Driver responses reach that task as messages; there is
//! no engine-wide lock. Everything after assignment goes straight to the
//! [`TripStateMachine`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::types::{ResponseOutcome, TripCommand, TripTicket};
use crate::channel::{OfferResult, RealtimeChannel};
use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::error::{ConfigError, DispatchError, LockError, TripError};
use crate::geo_index::GeoIndex;
use crate::lease::{AssignmentLock, InMemoryLeaseStore, LeaseStore};
use crate::model::{Availability, DriverId, DriverRecord, GeoPoint, TripId, VehicleClass};
use crate::persistence::{NoopPersistence, TripPersistence};
use crate::pricing::{CancellationPolicy, FareEstimator};
use crate::routing::{build_route_provider, RouteProvider, StraightLineRouteProvider};
use crate::surge::SurgeTracker;
use crate::telemetry::{DispatchTelemetry, TelemetrySnapshot};
use crate::trip::{CancelOutcome, Trip, TripMetrics, TripRequest, TripStateMachine};

/// Buffered driver responses per trip.
const INBOX_CAPACITY: usize = 64;

/// Drivers silent for this many staleness windows are dropped from the index.
const PURGE_AFTER_STALENESS_WINDOWS: u64 = 10;

pub struct EngineBuilder {
    config: DispatchConfig,
    channel: Arc<dyn RealtimeChannel>,
    clock: Option<Arc<dyn Clock>>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    route_provider: Option<Arc<dyn RouteProvider>>,
    persistence: Option<Arc<dyn TripPersistence>>,
}

impl EngineBuilder {
    pub fn new(config: DispatchConfig, channel: Arc<dyn RealtimeChannel>) -> Self {
        Self {
            config,
            channel,
            clock: None,
            lease_store: None,
            route_provider: None,
            persistence: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shared store backing the assignment lease. Defaults to an in-memory store.
    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    /// Overrides `config.route_provider`.
    pub fn route_provider(mut self, provider: Arc<dyn RouteProvider>) -> Self {
        self.route_provider = Some(provider);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn TripPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> Result<Arc<MatchingEngine>, DispatchError> {
        let config = self.config;
        config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let surge = Arc::new(SurgeTracker::new(config.surge_resolution()?, config.surge_cap));
        let geo = Arc::new(
            GeoIndex::new(config.index_settings()?, clock.clone()).with_surge(surge.clone()),
        );

        let store = self
            .lease_store
            .unwrap_or_else(|| Arc::new(InMemoryLeaseStore::new(clock.clone())));
        let lock = AssignmentLock::new(store, config.store_timeout());

        let router = match self.route_provider {
            Some(provider) => Some(provider),
            None => build_route_provider(&config.route_provider, config.transport_timeout())
                .map_err(|e| ConfigError::invalid("route_provider", e.to_string()))?,
        };
        let fallback = StraightLineRouteProvider::new(
            config.speed_profile.clone(),
            config.utc_offset_minutes,
            clock.clone(),
        );
        let fares = Arc::new(FareEstimator::new(
            config.pricing.clone(),
            router,
            fallback,
            config.transport_timeout(),
        ));

        let trips = Arc::new(TripStateMachine::new(
            lock.clone(),
            geo.clone(),
            fares.clone(),
            CancellationPolicy::new(&config.cancellation),
            self.persistence
                .unwrap_or_else(|| Arc::new(NoopPersistence)),
            config.retry.clone(),
            config.archive_capacity,
            clock.clone(),
        ));

        info!(
            fan_out = config.candidate_fan_out,
            offer_ttl_ms = config.offer_ttl_ms,
            max_rounds = config.max_escalation_rounds,
            "dispatch engine ready"
        );

        Ok(Arc::new(MatchingEngine {
            config,
            clock,
            geo,
            surge,
            lock,
            fares,
            trips,
            channel: self.channel,
            telemetry: Arc::new(DispatchTelemetry::default()),
            inboxes: DashMap::new(),
        }))
    }
}

pub struct MatchingEngine {
    pub(super) config: DispatchConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) geo: Arc<GeoIndex>,
    pub(super) surge: Arc<SurgeTracker>,
    pub(super) lock: AssignmentLock,
    pub(super) fares: Arc<FareEstimator>,
    pub(super) trips: Arc<TripStateMachine>,
    pub(super) channel: Arc<dyn RealtimeChannel>,
    pub(super) telemetry: Arc<DispatchTelemetry>,
    pub(super) inboxes: DashMap<TripId, mpsc::Sender<TripCommand>>,
}

impl MatchingEngine {
    pub fn builder(config: DispatchConfig, channel: Arc<dyn RealtimeChannel>) -> EngineBuilder {
        EngineBuilder::new(config, channel)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn geo(&self) -> &Arc<GeoIndex> {
        &self.geo
    }

    pub fn surge(&self) -> &Arc<SurgeTracker> {
        &self.surge
    }

    pub fn fares(&self) -> &Arc<FareEstimator> {
        &self.fares
    }

    pub fn trips(&self) -> &Arc<TripStateMachine> {
        &self.trips
    }

    pub fn lock(&self) -> &AssignmentLock {
        &self.lock
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn trip(&self, trip_id: TripId) -> Option<Trip> {
        self.trips.get(trip_id)
    }

    // -----------------------------------------------------------------------
    // Drivers
    // -----------------------------------------------------------------------

    /// Position update from a driver client.
    ///
    /// While the driver is bound to a trip the update also advances the trip's
    /// tracked distance, is forwarded to the rider and renews the lease. Those side
    /// effects are best-effort; only an invalid position fails the call.
    pub async fn report_driver_location(
        &self,
        driver_id: DriverId,
        vehicle_class: VehicleClass,
        point: GeoPoint,
        timestamp_ms: u64,
    ) -> Result<(), DispatchError> {
        // A driver reconnecting while bound to a trip comes back on that trip.
        let bound = self.trips.trip_for_driver(driver_id);
        let availability = if bound.is_some() {
            Availability::OnTrip
        } else {
            Availability::OnlineIdle
        };
        self.geo
            .upsert_as(driver_id, vehicle_class, point, timestamp_ms, availability)?;

        let Some(trip_id) = self.trips.trip_for_driver(driver_id) else {
            if bound.is_some() {
                // The trip ended between the lookup and the insert.
                self.geo.compare_and_set_availability(
                    driver_id,
                    Availability::OnTrip,
                    Availability::OnlineIdle,
                );
            }
            return Ok(());
        };
        if let Err(err) = self.trips.record_progress(trip_id, point) {
            trace!(%trip_id, %driver_id, error = %err, "location for a closed trip");
            return Ok(());
        }

        let forward = self.channel.send_driver_location(trip_id, point);
        match tokio::time::timeout(self.config.transport_timeout(), forward).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(%trip_id, error = %err, "driver location not forwarded"),
            Err(_) => debug!(%trip_id, "driver location forward timed out"),
        }

        let ttl = Duration::from_millis(self.config.lease_ttl_ms);
        match self.lock.renew(driver_id, trip_id, ttl).await {
            Ok(true) => {}
            Ok(false) => warn!(%trip_id, %driver_id, "lease lost while bound to trip"),
            Err(LockError::Timeout { .. }) => {
                DispatchTelemetry::incr(&self.telemetry.transport_failures);
                debug!(%trip_id, %driver_id, "lease renewal timed out");
            }
            Err(err) => {
                DispatchTelemetry::incr(&self.telemetry.storage_failures);
                error!(%trip_id, %driver_id, error = %err, "lease renewal failed");
            }
        }
        Ok(())
    }

    /// Driver went offline. Idempotent.
    pub fn driver_offline(&self, driver_id: DriverId) -> Option<DriverRecord> {
        self.geo.remove(driver_id)
    }

    // -----------------------------------------------------------------------
    // Riders
    // -----------------------------------------------------------------------

    /// Quote the trip, open it and start matching on a new task.
    pub async fn request_trip(
        self: &Arc<Self>,
        request: TripRequest,
    ) -> Result<TripTicket, DispatchError> {
        let pickup = GeoPoint::new(request.pickup.lat, request.pickup.lon)?;
        let dropoff = GeoPoint::new(request.dropoff.lat, request.dropoff.lon)?;
        let request = TripRequest {
            pickup,
            dropoff,
            ..request
        };

        let (surge_cell, multiplier) = self.surge.surge_at(pickup)?;
        let quote = self
            .fares
            .estimate(pickup, dropoff, request.vehicle_class, multiplier)
            .await;
        self.surge.demand_opened(surge_cell);

        let trip = self.trips.open(request, quote);
        let trip_id = trip.trip_id;
        DispatchTelemetry::incr(&self.telemetry.trips_requested);

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.insert(trip_id, inbox_tx);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let span = info_span!("trip", %trip_id, class = %request.vehicle_class);
        debug!(parent: &span, surge = multiplier, fare = quote.amount, "trip requested");
        tokio::spawn(
            self.clone()
                .run_trip(trip, surge_cell, inbox_rx, outcome_tx)
                .instrument(span),
        );

        Ok(TripTicket {
            trip_id,
            quote,
            outcome: outcome_rx,
        })
    }

    /// Rider cancellation from any non-terminal state. Idempotent.
    pub async fn cancel_trip(&self, trip_id: TripId) -> Result<CancelOutcome, DispatchError> {
        let outcome = self.trips.cancel(trip_id).await?;
        if let CancelOutcome::Cancelled { fee, driver_id } = outcome {
            DispatchTelemetry::incr(&self.telemetry.trips_cancelled);
            let inbox = self.inboxes.get(&trip_id).map(|tx| tx.clone());
            if let Some(inbox) = inbox {
                // A closed inbox means the task already finished.
                let _ = inbox.send(TripCommand::Cancel).await;
            }
            self.notify(trip_id, OfferResult::Cancelled { driver_id, fee });
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Offer responses
    // -----------------------------------------------------------------------

    /// Driver accepted an offer. Safe to call repeatedly; once the trip is decided,
    /// further accepts report the decision.
    pub async fn handle_accept(&self, trip_id: TripId, driver_id: DriverId) -> ResponseOutcome {
        self.dispatch_response(trip_id, driver_id, |reply| TripCommand::Accept {
            driver_id,
            reply,
        })
        .await
    }

    pub async fn handle_decline(&self, trip_id: TripId, driver_id: DriverId) -> ResponseOutcome {
        self.dispatch_response(trip_id, driver_id, |reply| TripCommand::Decline {
            driver_id,
            reply,
        })
        .await
    }

    async fn dispatch_response(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        command: impl FnOnce(oneshot::Sender<ResponseOutcome>) -> TripCommand,
    ) -> ResponseOutcome {
        let inbox = self.inboxes.get(&trip_id).map(|tx| tx.clone());
        let Some(inbox) = inbox else {
            return self.settled_response(trip_id, driver_id);
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if inbox.send(command(reply_tx)).await.is_err() {
            return self.settled_response(trip_id, driver_id);
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            // The task finished with the response still queued.
            Err(_) => self.settled_response(trip_id, driver_id),
        }
    }

    /// Answer for a response arriving after the trip's matching task ended.
    fn settled_response(&self, trip_id: TripId, driver_id: DriverId) -> ResponseOutcome {
        let Some(trip) = self.trips.get(trip_id) else {
            return ResponseOutcome::NotOffered;
        };
        match trip.driver_id {
            Some(winner) if winner == driver_id => ResponseOutcome::AlreadyAssigned,
            Some(_) => ResponseOutcome::OfferSuperseded,
            None if trip.state.is_terminal() => ResponseOutcome::TripClosed,
            None => ResponseOutcome::OfferExpired,
        }
    }

    // -----------------------------------------------------------------------
    // After assignment
    // -----------------------------------------------------------------------

    pub fn driver_enroute(&self, trip_id: TripId) -> Result<Trip, DispatchError> {
        Ok(self.trips.mark_enroute(trip_id)?)
    }

    pub fn start_trip(&self, trip_id: TripId) -> Result<Trip, DispatchError> {
        Ok(self.trips.start_trip(trip_id)?)
    }

    pub async fn complete_trip(
        &self,
        trip_id: TripId,
        metrics: TripMetrics,
    ) -> Result<Trip, DispatchError> {
        let trip = self.trips.complete(trip_id, metrics).await?;
        DispatchTelemetry::incr(&self.telemetry.trips_completed);
        Ok(trip)
    }

    /// Expire assigned trips whose lease lapsed (the driver client went silent).
    /// Returns the number of trips expired.
    pub async fn sweep_expired_assignments(&self) -> usize {
        let mut expired = 0;
        for (trip_id, driver_id) in self.trips.assigned_trips() {
            match self.lock.holder(driver_id).await {
                Ok(Some(holder)) if holder == trip_id => {}
                Ok(_) => match self.trips.expire(trip_id).await {
                    Ok(_) => {
                        expired += 1;
                        DispatchTelemetry::incr(&self.telemetry.trips_expired);
                        info!(%trip_id, %driver_id, "assignment expired, lease lapsed");
                        self.notify(trip_id, OfferResult::Expired { driver_id });
                    }
                    // Moved on (enroute, cancelled) since the listing.
                    Err(TripError::InvalidTransition { .. }) | Err(TripError::UnknownTrip(_)) => {}
                    Err(err) => warn!(%trip_id, error = %err, "could not expire trip"),
                },
                Err(err) => {
                    warn!(error = %err, "assignment sweep stopped, lease store unreachable");
                    break;
                }
            }
        }
        expired
    }

    /// Drop long-silent drivers, then rebuild surge supply from fresh idle ones.
    /// Returns the number of drivers counted as supply.
    pub fn refresh_supply(&self) -> usize {
        let max_age_ms = self
            .config
            .driver_staleness_ms
            .saturating_mul(PURGE_AFTER_STALENESS_WINDOWS);
        let purged = self.geo.purge_older_than(max_age_ms);
        if purged > 0 {
            debug!(purged, "silent drivers removed from index");
        }
        self.geo.refresh_supply()
    }

    /// Periodic supply refresh and assignment sweep. Tasks stop when the handle is
    /// dropped or the engine is gone.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> BackgroundTasks {
        let refresh_every = Duration::from_millis(self.config.surge_refresh_interval_ms);
        let sweep_every = Duration::from_millis(self.config.assignment_sweep_interval_ms);

        let engine = Arc::downgrade(self);
        let supply = tokio::spawn(periodic(engine, refresh_every, |engine| async move {
            let counted = engine.refresh_supply();
            trace!(counted, "surge supply refreshed");
        }));

        let engine = Arc::downgrade(self);
        let sweep = tokio::spawn(periodic(engine, sweep_every, |engine| async move {
            let expired = engine.sweep_expired_assignments().await;
            if expired > 0 {
                debug!(expired, "assignment sweep");
            }
        }));

        BackgroundTasks {
            handles: vec![supply, sweep],
        }
    }

    /// Best-effort push on a detached task.
    pub(super) fn notify(&self, trip_id: TripId, result: OfferResult) {
        let channel = self.channel.clone();
        let timeout = self.config.transport_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, channel.send_offer_result(trip_id, result)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(%trip_id, error = %err, "offer result not delivered"),
                Err(_) => debug!(%trip_id, "offer result delivery timed out"),
            }
        });
    }
}

async fn periodic<F, Fut>(engine: Weak<MatchingEngine>, every: Duration, mut tick: F)
where
    F: FnMut(Arc<MatchingEngine>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            break;
        };
        tick(engine).await;
    }
}

/// Handles of the engine's periodic tasks. Dropping it stops them.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
