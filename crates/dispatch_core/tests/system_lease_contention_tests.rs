//! Two engine instances sharing one lease store, as two dispatch nodes would.

mod support;

use std::sync::Arc;

use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::lease::{InMemoryLeaseStore, LeaseStore};
use dispatch_core::matching::{MatchOutcome, MatchingEngine, ResponseOutcome};
use dispatch_core::{DispatchConfig, DriverId, VehicleClass};
use support::*;

fn node(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> (Arc<MatchingEngine>, Arc<RecordingChannel>) {
    let channel = RecordingChannel::new();
    let engine = MatchingEngine::builder(DispatchConfig::default(), channel.clone())
        .clock(clock)
        .lease_store(store)
        .build()
        .expect("engine");
    (engine, channel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_driver_accepting_on_two_nodes_is_assigned_once() {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new(clock.clone()));
    let (west, west_channel) = node(store.clone(), clock.clone());
    let (east, east_channel) = node(store, clock.clone());

    for round in 0..20u64 {
        let driver = DriverId(100 + round);
        for engine in [&west, &east] {
            engine
                .report_driver_location(driver, VehicleClass::Economy, SF_CENTER, clock.now_ms())
                .await
                .expect("location");
        }

        let west_ticket = west.request_trip(economy_request(round)).await.expect("west");
        let east_ticket = east.request_trip(economy_request(round)).await.expect("east");
        west_channel.wait_for_offer(west_ticket.trip_id, driver).await;
        east_channel.wait_for_offer(east_ticket.trip_id, driver).await;

        let (west_engine, east_engine) = (west.clone(), east.clone());
        let (west_trip, east_trip) = (west_ticket.trip_id, east_ticket.trip_id);
        let west_accept = tokio::spawn(async move { west_engine.handle_accept(west_trip, driver).await });
        let east_accept = tokio::spawn(async move { east_engine.handle_accept(east_trip, driver).await });
        let responses = [
            west_accept.await.expect("west task"),
            east_accept.await.expect("east task"),
        ];

        let assigned = responses
            .iter()
            .filter(|r| matches!(r, ResponseOutcome::Assigned { .. }))
            .count();
        let contended = responses
            .iter()
            .filter(|r| **r == ResponseOutcome::LeaseContention)
            .count();
        assert_eq!((assigned, contended), (1, 1), "responses {responses:?}");

        // Close out both trips so the next iteration starts clean.
        for (engine, ticket) in [(&west, west_ticket), (&east, east_ticket)] {
            engine.cancel_trip(ticket.trip_id).await.expect("cancel");
            assert!(matches!(
                ticket.outcome.await,
                Ok(MatchOutcome::Assigned { .. } | MatchOutcome::Cancelled)
            ));
            engine.driver_offline(driver);
        }
    }
}
