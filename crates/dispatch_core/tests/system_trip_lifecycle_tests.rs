mod support;

use std::time::Duration;

use dispatch_core::channel::OfferResult;
use dispatch_core::error::TripError;
use dispatch_core::trip::TripMetrics;
use dispatch_core::{
    Availability, DispatchConfig, DispatchError, DriverId, TripState, VehicleClass,
};
use support::*;

#[tokio::test(start_paused = true)]
async fn trip_runs_from_assignment_to_completion() {
    let dispatch = TestDispatch::new(long_lived_drivers());
    let trip_id = assigned_trip(&dispatch, 1, 1).await;

    let trip = dispatch.engine.driver_enroute(trip_id).expect("enroute");
    assert_eq!(trip.state, TripState::DriverEnroute);
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_PICKUP)
        .await;

    let trip = dispatch.engine.start_trip(trip_id).expect("start");
    assert_eq!(trip.state, TripState::TripActive);
    assert_eq!(trip.tracked_distance_km, 0.0);

    // Location updates keep renewing the lease past its original expiry.
    for km in [1.0, 2.0] {
        tokio::time::advance(Duration::from_secs(100)).await;
        dispatch
            .driver_online(1, VehicleClass::Economy, east_of(SF_PICKUP, km))
            .await;
    }
    assert_eq!(dispatch.engine.lock().holder(DriverId(1)).await, Ok(Some(trip_id)));
    let trip = dispatch.engine.trip(trip_id).expect("trip");
    assert!((trip.tracked_distance_km - 2.0).abs() < 0.05);
    assert_eq!(dispatch.channel.locations_for(trip_id).len(), 3);

    let trip = dispatch
        .engine
        .complete_trip(
            trip_id,
            TripMetrics {
                distance_km: 3.0,
                duration_min: 10.0,
            },
        )
        .await
        .expect("complete");
    assert_eq!(trip.state, TripState::Completed);
    // 2.5 + 1.5 × 3 km + 0.3 × 10 min at surge 1.0
    assert_eq!(trip.final_fare, Some(10.0));

    assert_eq!(dispatch.engine.lock().holder(DriverId(1)).await, Ok(None));
    assert_eq!(dispatch.engine.trips().trip_for_driver(DriverId(1)), None);
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OnlineIdle)
    );

    settle().await;
    let persisted = dispatch.persistence.persisted();
    assert!(persisted
        .iter()
        .any(|t| t.trip_id == trip_id && t.state == TripState::Completed));
    let telemetry = dispatch.engine.telemetry();
    assert_eq!(telemetry.trips_completed, 1);
    assert_eq!(telemetry.match_rate(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_lifecycle_calls_are_rejected() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    let trip_id = assigned_trip(&dispatch, 1, 1).await;

    assert!(matches!(
        dispatch.engine.start_trip(trip_id),
        Err(DispatchError::Trip(TripError::InvalidTransition {
            from: TripState::Assigned,
            to: TripState::TripActive,
            ..
        }))
    ));

    dispatch.engine.driver_enroute(trip_id).expect("enroute");
    dispatch.engine.start_trip(trip_id).expect("start");
    let metrics = TripMetrics {
        distance_km: 1.0,
        duration_min: 4.0,
    };
    let trip = dispatch
        .engine
        .complete_trip(trip_id, metrics)
        .await
        .expect("complete");
    // Below the economy minimum.
    assert_eq!(trip.final_fare, Some(7.0));

    assert!(matches!(
        dispatch.engine.complete_trip(trip_id, metrics).await,
        Err(DispatchError::Trip(TripError::InvalidTransition {
            from: TripState::Completed,
            ..
        }))
    ));
}

#[tokio::test(start_paused = true)]
async fn lapsed_assignment_is_swept_and_driver_released() {
    let dispatch = TestDispatch::new(long_lived_drivers());
    let trip_id = assigned_trip(&dispatch, 1, 1).await;

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(dispatch.engine.sweep_expired_assignments().await, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(dispatch.engine.sweep_expired_assignments().await, 1);

    let trip = dispatch.engine.trip(trip_id).expect("trip");
    assert_eq!(trip.state, TripState::Expired);
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OnlineIdle)
    );
    dispatch
        .channel
        .wait_for_result(trip_id, |r| *r == OfferResult::Expired { driver_id: DriverId(1) })
        .await;
    assert_eq!(dispatch.engine.telemetry().trips_expired, 1);
}

#[tokio::test(start_paused = true)]
async fn background_sweep_expires_silent_assignments() {
    let dispatch = TestDispatch::new(long_lived_drivers());
    let tasks = dispatch.engine.spawn_background_tasks();
    let trip_id = assigned_trip(&dispatch, 1, 1).await;

    // A driver that keeps reporting holds on to the trip.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(60)).await;
        dispatch
            .driver_online(1, VehicleClass::Economy, SF_CENTER)
            .await;
    }
    assert_eq!(dispatch.engine.trip(trip_id).map(|t| t.state), Some(TripState::Assigned));

    tokio::time::sleep(Duration::from_secs(130)).await;
    assert_eq!(dispatch.engine.trip(trip_id).map(|t| t.state), Some(TripState::Expired));
    tasks.shutdown();
}

#[tokio::test(start_paused = true)]
async fn driver_reconnecting_mid_trip_stays_on_that_trip() {
    let dispatch = TestDispatch::new(long_lived_drivers());
    let trip_id = assigned_trip(&dispatch, 1, 1).await;
    dispatch.engine.driver_enroute(trip_id).expect("enroute");

    assert!(dispatch.engine.driver_offline(DriverId(1)).is_some());
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_CENTER)
        .await;
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OnTrip)
    );
    assert_eq!(dispatch.engine.refresh_supply(), 0);

    let other = dispatch.engine.request_trip(economy_request(2)).await.expect("request");
    assert!(matches!(
        other.outcome.await,
        Ok(dispatch_core::MatchOutcome::NoMatch {
            reason: dispatch_core::NoMatchReason::NoDriversAvailable
        })
    ));
    assert!(dispatch.channel.offers_to(DriverId(1)).iter().all(|o| o.trip_id == trip_id));

    // Once the trip is over the driver is idle again.
    dispatch.engine.start_trip(trip_id).expect("start");
    dispatch
        .engine
        .complete_trip(
            trip_id,
            TripMetrics {
                distance_km: 2.0,
                duration_min: 6.0,
            },
        )
        .await
        .expect("complete");
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OnlineIdle)
    );
}
