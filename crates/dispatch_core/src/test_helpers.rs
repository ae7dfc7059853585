//! Test doubles and fixtures shared by unit and integration tests.
//!
//! Engines built here run on [`SystemClock::anchored_at`], so a test with paused
//! tokio time sees lease expiry, staleness and offer deadlines move together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::channel::{ChannelEvent, OfferResult, RealtimeChannel};
use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::error::{ChannelError, PersistError, StoreError};
use crate::lease::{InMemoryLeaseStore, LeaseStore};
use crate::matching::{EngineBuilder, MatchingEngine, Offer};
use crate::model::{DriverId, GeoPoint, RiderId, TripId, VehicleClass};
use crate::persistence::TripPersistence;
use crate::trip::{Trip, TripRequest};

/// 2023-11-14T22:13:20Z.
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// Downtown San Francisco.
pub const SF_CENTER: GeoPoint = GeoPoint {
    lat: 37.7749,
    lon: -122.4194,
};

/// Pickup ~140 m from [`SF_CENTER`].
pub const SF_PICKUP: GeoPoint = GeoPoint {
    lat: 37.7755,
    lon: -122.4180,
};

/// Dropoff ~3 km north-east of [`SF_PICKUP`].
pub const SF_DROPOFF: GeoPoint = GeoPoint {
    lat: 37.7946,
    lon: -122.3999,
};

/// `point` moved `km` due east.
pub fn east_of(point: GeoPoint, km: f64) -> GeoPoint {
    let km_per_degree = 111.32 * point.lat.to_radians().cos();
    GeoPoint {
        lat: point.lat,
        lon: point.lon + km / km_per_degree,
    }
}

/// `point` moved `km` due north.
pub fn north_of(point: GeoPoint, km: f64) -> GeoPoint {
    GeoPoint {
        lat: point.lat + km / 110.574,
        lon: point.lon,
    }
}

pub fn economy_request(rider: u64) -> TripRequest {
    TripRequest {
        rider_id: RiderId(rider),
        pickup: SF_PICKUP,
        dropoff: SF_DROPOFF,
        vehicle_class: VehicleClass::Economy,
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Records every push and lets tests wait for a specific one.
#[derive(Debug)]
pub struct RecordingChannel {
    events: Mutex<Vec<ChannelEvent>>,
    version: watch::Sender<usize>,
    failing_drivers: Mutex<HashMap<DriverId, ChannelError>>,
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            version: watch::Sender::new(0),
            failing_drivers: Mutex::new(HashMap::new()),
        }
    }
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every offer to `driver_id` fails with `error` from now on.
    pub fn fail_offers_to(&self, driver_id: DriverId, error: ChannelError) {
        self.failing_drivers.lock().insert(driver_id, error);
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    pub fn offers_to(&self, driver_id: DriverId) -> Vec<Offer> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Offer { driver_id: to, offer } if *to == driver_id => {
                    Some(offer.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn offers_for_trip(&self, trip_id: TripId) -> Vec<Offer> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Offer { offer, .. } if offer.trip_id == trip_id => {
                    Some(offer.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn results_for(&self, trip_id: TripId) -> Vec<OfferResult> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Result { trip_id: id, result } if *id == trip_id => {
                    Some(result.clone())
                }
                _ => None,
            })
            .collect()
    }

    pub fn locations_for(&self, trip_id: TripId) -> Vec<GeoPoint> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::DriverLocation { trip_id: id, point } if *id == trip_id => {
                    Some(*point)
                }
                _ => None,
            })
            .collect()
    }

    /// Wait until an event matching `pred` has been recorded, and return it.
    pub async fn wait_for(&self, pred: impl Fn(&ChannelEvent) -> bool) -> ChannelEvent {
        let mut changes = self.version.subscribe();
        loop {
            if let Some(event) = self.events.lock().iter().find(|e| pred(e)) {
                return event.clone();
            }
            if changes.changed().await.is_err() {
                panic!("recording channel dropped while waiting");
            }
        }
    }

    /// Wait for the first offer of `trip_id` to `driver_id`.
    pub async fn wait_for_offer(&self, trip_id: TripId, driver_id: DriverId) -> Offer {
        match self
            .wait_for(|event| {
                matches!(event, ChannelEvent::Offer { driver_id: to, offer }
                    if *to == driver_id && offer.trip_id == trip_id)
            })
            .await
        {
            ChannelEvent::Offer { offer, .. } => offer,
            other => panic!("expected an offer, got {other:?}"),
        }
    }

    /// Wait for the offer of `trip_id` to `driver_id` in escalation round `round`.
    pub async fn wait_for_offer_in_round(
        &self,
        trip_id: TripId,
        driver_id: DriverId,
        round: u32,
    ) -> Offer {
        match self
            .wait_for(|event| {
                matches!(event, ChannelEvent::Offer { driver_id: to, offer }
                    if *to == driver_id && offer.trip_id == trip_id && offer.round == round)
            })
            .await
        {
            ChannelEvent::Offer { offer, .. } => offer,
            other => panic!("expected an offer, got {other:?}"),
        }
    }

    pub async fn wait_for_result(
        &self,
        trip_id: TripId,
        pred: impl Fn(&OfferResult) -> bool,
    ) -> OfferResult {
        match self
            .wait_for(|event| {
                matches!(event, ChannelEvent::Result { trip_id: id, result }
                    if *id == trip_id && pred(result))
            })
            .await
        {
            ChannelEvent::Result { result, .. } => result,
            other => panic!("expected a result, got {other:?}"),
        }
    }

    fn record(&self, event: ChannelEvent) {
        self.events.lock().push(event);
        self.version.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl RealtimeChannel for RecordingChannel {
    async fn send_offer(&self, driver_id: DriverId, offer: &Offer) -> Result<(), ChannelError> {
        let failure = self.failing_drivers.lock().get(&driver_id).cloned();
        if let Some(err) = failure {
            return Err(err);
        }
        self.record(ChannelEvent::Offer {
            driver_id,
            offer: offer.clone(),
        });
        Ok(())
    }

    async fn send_offer_result(
        &self,
        trip_id: TripId,
        result: OfferResult,
    ) -> Result<(), ChannelError> {
        self.record(ChannelEvent::Result { trip_id, result });
        Ok(())
    }

    async fn send_driver_location(
        &self,
        trip_id: TripId,
        point: GeoPoint,
    ) -> Result<(), ChannelError> {
        self.record(ChannelEvent::DriverLocation { trip_id, point });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// In-memory lease store that can be switched off to simulate a store outage.
#[derive(Debug)]
pub struct SwitchableLeaseStore {
    inner: InMemoryLeaseStore,
    available: AtomicBool,
}

impl SwitchableLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemoryLeaseStore::new(clock),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl LeaseStore for SwitchableLeaseStore {
    async fn put_if_vacant(
        &self,
        key: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.put_if_vacant(key, holder, ttl_ms).await
    }

    async fn delete_if_holder(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.delete_if_holder(key, holder).await
    }

    async fn extend_if_holder(
        &self,
        key: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.extend_if_holder(key, holder, ttl_ms).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingPersistence {
    trips: Mutex<Vec<Trip>>,
}

impl RecordingPersistence {
    pub fn persisted(&self) -> Vec<Trip> {
        self.trips.lock().clone()
    }
}

#[async_trait]
impl TripPersistence for RecordingPersistence {
    async fn persist(&self, trip: &Trip) -> Result<(), PersistError> {
        self.trips.lock().push(trip.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// An engine wired to recording doubles.
pub struct TestDispatch {
    pub engine: Arc<MatchingEngine>,
    pub channel: Arc<RecordingChannel>,
    pub store: Arc<SwitchableLeaseStore>,
    pub persistence: Arc<RecordingPersistence>,
    pub clock: Arc<SystemClock>,
}

impl TestDispatch {
    /// Build an engine over `config`. Must run inside a tokio runtime.
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_builder(config, |builder| builder)
    }

    /// Like [`new`](Self::new), with a hook to adjust the builder before `build`.
    pub fn with_builder(
        config: DispatchConfig,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        let clock = Arc::new(SystemClock::anchored_at(TEST_EPOCH_MS));
        let channel = RecordingChannel::new();
        let store = Arc::new(SwitchableLeaseStore::new(clock.clone()));
        let persistence = Arc::new(RecordingPersistence::default());
        let builder = MatchingEngine::builder(config, channel.clone())
            .clock(clock.clone())
            .lease_store(store.clone())
            .persistence(persistence.clone());
        let engine = customize(builder).build().expect("test config is valid");
        Self {
            engine,
            channel,
            store,
            persistence,
            clock,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Report `driver_id` online at `point` with the current timestamp.
    pub async fn driver_online(&self, driver_id: u64, class: VehicleClass, point: GeoPoint) {
        self.engine
            .report_driver_location(DriverId(driver_id), class, point, self.now_ms())
            .await
            .expect("valid driver position");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_move_roughly_the_requested_distance() {
        let east = east_of(SF_CENTER, 1.0);
        let north = north_of(SF_CENTER, 1.0);
        assert!((SF_CENTER.distance_km(&east) - 1.0).abs() < 0.01);
        assert!((SF_CENTER.distance_km(&north) - 1.0).abs() < 0.01);
    }

    #[test]
    fn scenario_points_are_close_together() {
        let d = SF_CENTER.distance_km(&SF_PICKUP);
        assert!(d > 0.1 && d < 0.2, "distance {d}");
        let trip = SF_PICKUP.distance_km(&SF_DROPOFF);
        assert!(trip > 2.0 && trip < 3.5, "distance {trip}");
    }
}
