//! Push boundary towards driver and rider endpoints.
//!
//! Delivery is at-least-once; the engine tolerates duplicates. Transport framing
//! (WebSocket, push notifications) lives behind implementations of
//! [`RealtimeChannel`].

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ChannelError, NoMatchReason};
use crate::matching::Offer;
use crate::model::{DriverId, GeoPoint, TripId};

/// Outcome notifications about a trip's offers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OfferResult {
    /// `driver_id` won the trip. Sent to the rider and the winning driver.
    Assigned {
        driver_id: DriverId,
        pickup_eta_ms: u64,
    },
    /// `driver_id`'s offer lost to another driver.
    Superseded { driver_id: DriverId },
    /// `driver_id`'s offer lapsed without a successful accept.
    Expired { driver_id: DriverId },
    /// Matching gave up. Sent to the rider.
    NoMatch { reason: NoMatchReason },
    /// The rider cancelled; `driver_id` is the assigned or offered driver, if any.
    Cancelled {
        driver_id: Option<DriverId>,
        fee: f64,
    },
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn send_offer(&self, driver_id: DriverId, offer: &Offer) -> Result<(), ChannelError>;

    async fn send_offer_result(
        &self,
        trip_id: TripId,
        result: OfferResult,
    ) -> Result<(), ChannelError>;

    /// Forward the assigned driver's position to the rider.
    async fn send_driver_location(
        &self,
        trip_id: TripId,
        point: GeoPoint,
    ) -> Result<(), ChannelError>;
}

/// Everything pushed through an [`InProcessChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Offer { driver_id: DriverId, offer: Offer },
    Result { trip_id: TripId, result: OfferResult },
    DriverLocation { trip_id: TripId, point: GeoPoint },
}

/// Channel delivering every push as a [`ChannelEvent`] on an in-process queue.
#[derive(Debug, Clone)]
pub struct InProcessChannel {
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl InProcessChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn push(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        self.events
            .send(event)
            .map_err(|_| ChannelError::Disconnected("event queue closed".to_string()))
    }
}

#[async_trait]
impl RealtimeChannel for InProcessChannel {
    async fn send_offer(&self, driver_id: DriverId, offer: &Offer) -> Result<(), ChannelError> {
        self.push(ChannelEvent::Offer {
            driver_id,
            offer: offer.clone(),
        })
    }

    async fn send_offer_result(
        &self,
        trip_id: TripId,
        result: OfferResult,
    ) -> Result<(), ChannelError> {
        self.push(ChannelEvent::Result { trip_id, result })
    }

    async fn send_driver_location(
        &self,
        trip_id: TripId,
        point: GeoPoint,
    ) -> Result<(), ChannelError> {
        self.push(ChannelEvent::DriverLocation { trip_id, point })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (channel, mut rx) = InProcessChannel::new();
        channel
            .send_offer_result(TripId(1), OfferResult::Expired { driver_id: DriverId(2) })
            .await
            .expect("send");
        channel
            .send_driver_location(TripId(1), GeoPoint { lat: 1.0, lon: 2.0 })
            .await
            .expect("send");

        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::Result {
                trip_id: TripId(1),
                result: OfferResult::Expired { driver_id: DriverId(2) },
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::DriverLocation { .. })
        ));
    }

    #[tokio::test]
    async fn closed_queue_reports_disconnected() {
        let (channel, rx) = InProcessChannel::new();
        drop(rx);
        let err = channel
            .send_offer_result(
                TripId(1),
                OfferResult::NoMatch {
                    reason: NoMatchReason::NoDriversAvailable,
                },
            )
            .await
            .expect_err("closed");
        assert!(!err.is_transient());
    }

    #[test]
    fn results_serialize_with_a_tag() {
        let json = serde_json::to_value(OfferResult::Superseded {
            driver_id: DriverId(4),
        })
        .expect("json");
        assert_eq!(json["result"], "superseded");
        assert_eq!(json["driver_id"], 4);
    }
}
