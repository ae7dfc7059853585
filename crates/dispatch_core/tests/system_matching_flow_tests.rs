mod support;

use dispatch_core::channel::OfferResult;
use dispatch_core::error::ChannelError;
use dispatch_core::matching::{MatchOutcome, ResponseOutcome};
use dispatch_core::{Availability, DispatchConfig, DriverId, TripState, VehicleClass};
use support::*;

#[tokio::test(start_paused = true)]
async fn nearby_driver_accepts_and_is_assigned() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    dispatch
        .driver_online(7, VehicleClass::Economy, SF_CENTER)
        .await;

    let ticket = dispatch
        .engine
        .request_trip(economy_request(1))
        .await
        .expect("request trip");
    assert_eq!(ticket.quote.surge_multiplier, 1.0);

    let offer = dispatch.channel.wait_for_offer(ticket.trip_id, DriverId(7)).await;
    assert_eq!(offer.round, 1);
    assert_eq!(offer.quote, ticket.quote);
    assert!(offer.pickup_distance_km < 0.2, "distance {}", offer.pickup_distance_km);

    let response = dispatch.engine.handle_accept(ticket.trip_id, DriverId(7)).await;
    assert_eq!(
        response,
        ResponseOutcome::Assigned {
            trip_id: ticket.trip_id,
            pickup_eta_ms: offer.pickup_eta_ms,
        }
    );
    let outcome = ticket.outcome.await.expect("outcome");
    assert_eq!(
        outcome,
        MatchOutcome::Assigned {
            driver_id: DriverId(7),
            pickup_eta_ms: offer.pickup_eta_ms,
            round: 1,
        }
    );

    let trip = dispatch.engine.trip(ticket.trip_id).expect("trip");
    assert_eq!(trip.state, TripState::Assigned);
    assert_eq!(trip.driver_id, Some(DriverId(7)));
    assert_eq!(
        dispatch.engine.lock().holder(DriverId(7)).await,
        Ok(Some(ticket.trip_id))
    );
    assert_eq!(
        dispatch.engine.geo().get(DriverId(7)).map(|r| r.availability),
        Some(Availability::OnTrip)
    );

    dispatch
        .channel
        .wait_for_result(ticket.trip_id, |r| {
            matches!(r, OfferResult::Assigned { driver_id, .. } if *driver_id == DriverId(7))
        })
        .await;
    let telemetry = dispatch.engine.telemetry();
    assert_eq!(telemetry.trips_requested, 1);
    assert_eq!(telemetry.trips_assigned, 1);
    assert_eq!(telemetry.offers_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn first_accept_wins_and_siblings_are_superseded() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    for driver in 1..=3 {
        dispatch
            .driver_online(driver, VehicleClass::Economy, east_of(SF_PICKUP, 0.1 * driver as f64))
            .await;
    }

    let ticket = dispatch.engine.request_trip(economy_request(1)).await.expect("request");
    let trip_id = ticket.trip_id;
    for driver in 1..=3 {
        dispatch.channel.wait_for_offer(trip_id, DriverId(driver)).await;
    }

    assert!(matches!(
        dispatch.engine.handle_accept(trip_id, DriverId(2)).await,
        ResponseOutcome::Assigned { .. }
    ));
    assert_eq!(
        dispatch.engine.handle_accept(trip_id, DriverId(1)).await,
        ResponseOutcome::OfferSuperseded
    );
    assert_eq!(
        dispatch.engine.handle_accept(trip_id, DriverId(2)).await,
        ResponseOutcome::AlreadyAssigned
    );
    assert_eq!(
        dispatch.engine.handle_decline(trip_id, DriverId(3)).await,
        ResponseOutcome::OfferSuperseded
    );

    for loser in [1, 3] {
        dispatch
            .channel
            .wait_for_result(trip_id, |r| {
                matches!(r, OfferResult::Superseded { driver_id } if *driver_id == DriverId(loser))
            })
            .await;
    }
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OnlineIdle)
    );
}

#[tokio::test(start_paused = true)]
async fn simultaneous_accepts_produce_exactly_one_assignment() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    for driver in 1..=3 {
        dispatch
            .driver_online(driver, VehicleClass::Economy, east_of(SF_PICKUP, 0.2 * driver as f64))
            .await;
    }
    let ticket = dispatch.engine.request_trip(economy_request(1)).await.expect("request");
    let trip_id = ticket.trip_id;
    for driver in 1..=3 {
        dispatch.channel.wait_for_offer(trip_id, DriverId(driver)).await;
    }

    let engine = &dispatch.engine;
    let (a, b, c) = tokio::join!(
        engine.handle_accept(trip_id, DriverId(1)),
        engine.handle_accept(trip_id, DriverId(2)),
        engine.handle_accept(trip_id, DriverId(3)),
    );
    let responses = [a, b, c];
    let winners = responses
        .iter()
        .filter(|r| matches!(r, ResponseOutcome::Assigned { .. }))
        .count();
    assert_eq!(winners, 1, "responses {responses:?}");
    assert_eq!(
        responses
            .iter()
            .filter(|r| **r == ResponseOutcome::OfferSuperseded)
            .count(),
        2
    );

    let outcome = ticket.outcome.await.expect("outcome");
    let MatchOutcome::Assigned { driver_id, .. } = outcome else {
        panic!("expected assignment, got {outcome:?}");
    };
    assert_eq!(dispatch.engine.lock().holder(driver_id).await, Ok(Some(trip_id)));
}

#[tokio::test(start_paused = true)]
async fn driver_shared_by_two_trips_is_assigned_to_one_only() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_CENTER)
        .await;
    dispatch
        .driver_online(2, VehicleClass::Economy, east_of(SF_PICKUP, 0.4))
        .await;

    let first = dispatch.engine.request_trip(economy_request(10)).await.expect("first");
    let second = dispatch.engine.request_trip(economy_request(11)).await.expect("second");
    for trip_id in [first.trip_id, second.trip_id] {
        for driver in [1, 2] {
            dispatch.channel.wait_for_offer(trip_id, DriverId(driver)).await;
        }
    }

    assert!(matches!(
        dispatch.engine.handle_accept(first.trip_id, DriverId(1)).await,
        ResponseOutcome::Assigned { .. }
    ));
    assert_eq!(
        dispatch.engine.handle_accept(second.trip_id, DriverId(1)).await,
        ResponseOutcome::LeaseContention
    );
    assert!(matches!(
        dispatch.engine.handle_accept(second.trip_id, DriverId(2)).await,
        ResponseOutcome::Assigned { .. }
    ));

    assert!(matches!(
        first.outcome.await,
        Ok(MatchOutcome::Assigned { driver_id: DriverId(1), .. })
    ));
    assert!(matches!(
        second.outcome.await,
        Ok(MatchOutcome::Assigned { driver_id: DriverId(2), .. })
    ));
    assert_eq!(dispatch.engine.telemetry().lease_contentions, 1);
    assert_eq!(
        dispatch.engine.lock().holder(DriverId(1)).await,
        Ok(Some(first.trip_id))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_round_escalates_to_the_next_driver() {
    let dispatch = TestDispatch::new(DispatchConfig::default().with_candidate_fan_out(1));
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_CENTER)
        .await;
    dispatch
        .driver_online(2, VehicleClass::Economy, east_of(SF_PICKUP, 0.8))
        .await;

    let ticket = dispatch.engine.request_trip(economy_request(1)).await.expect("request");
    let trip_id = ticket.trip_id;
    let started = tokio::time::Instant::now();
    let first = dispatch.channel.wait_for_offer(trip_id, DriverId(1)).await;
    assert_eq!(first.round, 1);

    // Nobody answers round one; the deadline moves the search on.
    let second = dispatch.channel.wait_for_offer(trip_id, DriverId(2)).await;
    assert_eq!(second.round, 2);
    assert!(started.elapsed() >= dispatch.engine.config().offer_ttl());
    assert!(dispatch.channel.offers_to(DriverId(1)).len() == 1);

    assert_eq!(
        dispatch.engine.handle_accept(trip_id, DriverId(1)).await,
        ResponseOutcome::OfferExpired
    );
    assert!(matches!(
        dispatch.engine.handle_accept(trip_id, DriverId(2)).await,
        ResponseOutcome::Assigned { .. }
    ));
    assert!(matches!(
        ticket.outcome.await,
        Ok(MatchOutcome::Assigned { driver_id: DriverId(2), round: 2, .. })
    ));
    assert!(dispatch
        .channel
        .results_for(trip_id)
        .contains(&OfferResult::Expired { driver_id: DriverId(1) }));
    assert_eq!(dispatch.engine.telemetry().offers_expired, 1);
}

#[tokio::test(start_paused = true)]
async fn declined_driver_cannot_accept_later() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_CENTER)
        .await;
    dispatch
        .driver_online(2, VehicleClass::Economy, east_of(SF_PICKUP, 0.3))
        .await;
    let ticket = dispatch.engine.request_trip(economy_request(1)).await.expect("request");
    let trip_id = ticket.trip_id;
    dispatch.channel.wait_for_offer(trip_id, DriverId(1)).await;
    dispatch.channel.wait_for_offer(trip_id, DriverId(2)).await;

    assert_eq!(
        dispatch.engine.handle_decline(trip_id, DriverId(1)).await,
        ResponseOutcome::Declined
    );
    assert_eq!(
        dispatch.engine.handle_accept(trip_id, DriverId(1)).await,
        ResponseOutcome::Declined
    );
    assert_eq!(
        dispatch.engine.handle_accept(trip_id, DriverId(9)).await,
        ResponseOutcome::NotOffered
    );
    assert!(matches!(
        dispatch.engine.handle_accept(trip_id, DriverId(2)).await,
        ResponseOutcome::Assigned { .. }
    ));
    assert!(matches!(
        ticket.outcome.await,
        Ok(MatchOutcome::Assigned { driver_id: DriverId(2), round: 1, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn unreachable_driver_is_skipped() {
    let dispatch = TestDispatch::new(DispatchConfig::default());
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_CENTER)
        .await;
    dispatch
        .driver_online(2, VehicleClass::Economy, east_of(SF_PICKUP, 0.3))
        .await;
    dispatch.channel.fail_offers_to(DriverId(1), ChannelError::Timeout);

    let ticket = dispatch.engine.request_trip(economy_request(1)).await.expect("request");
    let trip_id = ticket.trip_id;
    dispatch.channel.wait_for_offer(trip_id, DriverId(2)).await;

    assert!(dispatch.channel.offers_to(DriverId(1)).is_empty());
    assert_eq!(
        dispatch.engine.handle_accept(trip_id, DriverId(1)).await,
        ResponseOutcome::TransportTimeout
    );
    assert!(matches!(
        dispatch.engine.handle_accept(trip_id, DriverId(2)).await,
        ResponseOutcome::Assigned { .. }
    ));
    ticket.outcome.await.expect("outcome");

    let telemetry = dispatch.engine.telemetry();
    assert_eq!(telemetry.transport_failures, 1);
    assert_eq!(telemetry.offers_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn exclusive_offers_hide_offered_drivers_from_other_trips() {
    let dispatch = TestDispatch::new(DispatchConfig::default().with_exclusive_offers(true));
    dispatch
        .driver_online(1, VehicleClass::Economy, SF_CENTER)
        .await;

    let first = dispatch.engine.request_trip(economy_request(1)).await.expect("first");
    dispatch.channel.wait_for_offer(first.trip_id, DriverId(1)).await;
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OfferPending)
    );

    let second = dispatch.engine.request_trip(economy_request(2)).await.expect("second");
    assert!(matches!(
        second.outcome.await,
        Ok(MatchOutcome::NoMatch { reason: dispatch_core::NoMatchReason::NoDriversAvailable })
    ));

    // The unanswered offer lapses and the driver is idle again.
    assert!(matches!(
        first.outcome.await,
        Ok(MatchOutcome::NoMatch { reason: dispatch_core::NoMatchReason::EscalationExhausted })
    ));
    assert_eq!(
        dispatch.engine.geo().get(DriverId(1)).map(|r| r.availability),
        Some(Availability::OnlineIdle)
    );
}
