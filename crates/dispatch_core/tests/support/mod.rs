#![allow(dead_code)]

use std::time::Duration;

use dispatch_core::matching::{MatchOutcome, ResponseOutcome};
use dispatch_core::{DispatchConfig, DriverId, TripId, VehicleClass};

pub use dispatch_core::test_helpers::*;

/// Default config with driver records that stay fresh across several rounds.
pub fn long_lived_drivers() -> DispatchConfig {
    DispatchConfig {
        driver_staleness_ms: 300_000,
        ..DispatchConfig::default()
    }
}

/// Let spawned notification and persistence tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Put `driver` online at [`SF_CENTER`], request an economy trip and have the
/// driver accept it. Returns the assigned trip.
pub async fn assigned_trip(dispatch: &TestDispatch, driver: u64, rider: u64) -> TripId {
    dispatch
        .driver_online(driver, VehicleClass::Economy, SF_CENTER)
        .await;
    let ticket = dispatch
        .engine
        .request_trip(economy_request(rider))
        .await
        .expect("request trip");
    dispatch
        .channel
        .wait_for_offer(ticket.trip_id, DriverId(driver))
        .await;
    let response = dispatch
        .engine
        .handle_accept(ticket.trip_id, DriverId(driver))
        .await;
    assert!(
        matches!(response, ResponseOutcome::Assigned { .. }),
        "unexpected response {response:?}"
    );
    let outcome = ticket.outcome.await.expect("matching outcome");
    assert!(matches!(outcome, MatchOutcome::Assigned { .. }));
    ticket.trip_id
}
