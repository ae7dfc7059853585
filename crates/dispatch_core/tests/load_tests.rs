//! Load tests for dispatch_core: many concurrent trips competing for drivers.

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dispatch_core::channel::{ChannelEvent, InProcessChannel};
use dispatch_core::clock::{Clock, SystemClock};
use dispatch_core::matching::{MatchOutcome, MatchingEngine};
use dispatch_core::{DispatchConfig, DriverId, VehicleClass};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Only run explicitly: cargo test --package dispatch_core --test load_tests -- --ignored
async fn concurrent_trips_never_share_a_driver() {
    const DRIVERS: u64 = 2_000;
    const TRIPS: u64 = 500;

    let config = DispatchConfig::default().with_offer_ttl_ms(500);
    let (channel, mut events) = InProcessChannel::new();
    let clock = Arc::new(SystemClock::new());
    let engine = MatchingEngine::builder(config, Arc::new(channel))
        .clock(clock.clone())
        .build()
        .expect("engine");

    let mut rng = StdRng::seed_from_u64(42);
    for driver in 0..DRIVERS {
        let point = north_of(
            east_of(SF_CENTER, rng.gen_range(-3.0..3.0)),
            rng.gen_range(-3.0..3.0),
        );
        engine
            .report_driver_location(DriverId(driver), VehicleClass::Economy, point, clock.now_ms())
            .await
            .expect("location");
    }

    // Every driver accepts every offer it sees.
    let responder = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ChannelEvent::Offer { driver_id, offer } = event {
                    let engine = engine.clone();
                    tokio::spawn(async move { engine.handle_accept(offer.trip_id, driver_id).await });
                }
            }
        })
    };

    let started = Instant::now();
    let mut tickets = Vec::new();
    for rider in 0..TRIPS {
        let request = dispatch_core::TripRequest {
            pickup: north_of(
                east_of(SF_CENTER, rng.gen_range(-2.0..2.0)),
                rng.gen_range(-2.0..2.0),
            ),
            ..economy_request(rider)
        };
        tickets.push(engine.request_trip(request).await.expect("request"));
    }

    let mut assigned = HashSet::new();
    let mut no_match = 0;
    for ticket in tickets {
        match ticket.outcome.await.expect("outcome") {
            MatchOutcome::Assigned { driver_id, .. } => {
                assert!(assigned.insert(driver_id), "{driver_id} assigned twice");
            }
            MatchOutcome::NoMatch { .. } => no_match += 1,
            MatchOutcome::Cancelled => panic!("nothing was cancelled"),
        }
    }
    let duration = started.elapsed();
    responder.abort();

    let telemetry = engine.telemetry();
    println!(
        "{TRIPS} trips over {DRIVERS} drivers in {:.2}s: {} assigned, {no_match} no match, {} contentions",
        duration.as_secs_f64(),
        assigned.len(),
        telemetry.lease_contentions,
    );
    assert_eq!(assigned.len() as u64 + no_match, TRIPS);
    assert!(telemetry.match_rate() > 0.9, "match rate {}", telemetry.match_rate());
}
