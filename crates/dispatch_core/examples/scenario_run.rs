//! Run 200 riders against 80 drivers around downtown San Francisco and print the
//! dispatch counters.
//!
//! Run with: cargo run -p dispatch_core --example scenario_run
//! Log level via RUST_LOG (e.g. RUST_LOG=dispatch_core=debug); config overrides via
//! DISPATCH_* environment variables.

use std::sync::Arc;
use std::time::Duration;

use dispatch_core::channel::{ChannelEvent, InProcessChannel};
use dispatch_core::matching::{MatchOutcome, MatchingEngine, TripTicket};
use dispatch_core::test_helpers::{east_of, north_of, SF_CENTER, SF_DROPOFF};
use dispatch_core::trip::TripMetrics;
use dispatch_core::{DispatchConfig, DriverId, RiderId, TripRequest, VehicleClass};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

const NUM_DRIVERS: u64 = 80;
const NUM_RIDERS: u64 = 200;
const ACCEPT_PROBABILITY: f64 = 0.7;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DispatchConfig::default()
        .with_offer_ttl_ms(2_000)
        .with_env_overrides()?;
    let (channel, mut events) = InProcessChannel::new();
    let engine = MatchingEngine::builder(config, Arc::new(channel)).build()?;
    let _background = engine.spawn_background_tasks();

    let mut rng = StdRng::seed_from_u64(123);
    for driver in 0..NUM_DRIVERS {
        let point = north_of(
            east_of(SF_CENTER, rng.gen_range(-4.0..4.0)),
            rng.gen_range(-4.0..4.0),
        );
        engine
            .report_driver_location(DriverId(driver), VehicleClass::Economy, point, now_ms())
            .await?;
    }

    // Drivers answer offers after a short think time; some decline.
    let responder = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(7);
            while let Some(event) = events.recv().await {
                let ChannelEvent::Offer { driver_id, offer } = event else {
                    continue;
                };
                let accepts = rng.gen_bool(ACCEPT_PROBABILITY);
                let think = Duration::from_millis(rng.gen_range(50..1_500));
                let engine = engine.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(think).await;
                    if accepts {
                        engine.handle_accept(offer.trip_id, driver_id).await;
                    } else {
                        engine.handle_decline(offer.trip_id, driver_id).await;
                    }
                });
            }
        })
    };

    let mut rides = Vec::new();
    for rider in 0..NUM_RIDERS {
        let request = TripRequest {
            rider_id: RiderId(rider),
            pickup: north_of(
                east_of(SF_CENTER, rng.gen_range(-3.0..3.0)),
                rng.gen_range(-3.0..3.0),
            ),
            dropoff: SF_DROPOFF,
            vehicle_class: VehicleClass::Economy,
        };
        let ticket = engine.request_trip(request).await?;
        rides.push(tokio::spawn(ride(engine.clone(), ticket)));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for handle in rides {
        if let Err(err) = handle.await? {
            eprintln!("ride failed: {err}");
        }
    }
    responder.abort();

    let telemetry = engine.telemetry();
    println!("--- Scenario run ({NUM_RIDERS} riders, {NUM_DRIVERS} drivers, seed 123) ---");
    println!("{}", serde_json::to_string_pretty(&telemetry)?);
    println!("Match rate: {:.1}%", telemetry.match_rate() * 100.0);
    if let Some(latency) = telemetry.mean_match_latency_ms() {
        println!("Mean time to match: {latency} ms");
    }
    Ok(())
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Drive an assigned trip through pickup and drop-off.
async fn ride(engine: Arc<MatchingEngine>, ticket: TripTicket) -> Result<(), BoxError> {
    let MatchOutcome::Assigned { .. } = ticket.outcome.await? else {
        return Ok(());
    };
    engine.driver_enroute(ticket.trip_id)?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.start_trip(ticket.trip_id)?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    engine
        .complete_trip(
            ticket.trip_id,
            TripMetrics {
                distance_km: ticket.quote.distance_km,
                duration_min: ticket.quote.duration_min,
            },
        )
        .await?;
    Ok(())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
