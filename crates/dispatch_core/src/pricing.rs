//! Fare quotes and cancellation fees.
//!
//! Formula: `fare = max(minimum, base + per_km × km + per_minute × minutes) × surge`,
//! rounded to cents.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CancellationConfig, PricingConfig};
use crate::model::{GeoPoint, VehicleClass};
use crate::routing::{RouteEstimate, RouteProvider, RouteSource, StraightLineRouteProvider};

pub fn round_to_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub vehicle_class: VehicleClass,
    pub distance_km: f64,
    pub duration_min: f64,
    pub surge_multiplier: f64,
    pub amount: f64,
    pub route_source: RouteSource,
}

pub struct FareEstimator {
    pricing: PricingConfig,
    router: Option<Arc<dyn RouteProvider>>,
    fallback: StraightLineRouteProvider,
    route_timeout: Duration,
}

impl FareEstimator {
    pub fn new(
        pricing: PricingConfig,
        router: Option<Arc<dyn RouteProvider>>,
        fallback: StraightLineRouteProvider,
        route_timeout: Duration,
    ) -> Self {
        Self {
            pricing,
            router,
            fallback,
            route_timeout,
        }
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Fare for a known distance and duration.
    pub fn fare_for(
        &self,
        class: VehicleClass,
        distance_km: f64,
        duration_min: f64,
        surge_multiplier: f64,
    ) -> f64 {
        let rates = self.pricing.rates_for(class);
        let metered =
            rates.base + rates.per_km * distance_km.max(0.0) + rates.per_minute * duration_min.max(0.0);
        round_to_cents(metered.max(rates.minimum) * surge_multiplier)
    }

    /// Distance and duration from the routing service, or the straight-line
    /// estimate when it is absent, fails, or exceeds the timeout.
    pub async fn route(&self, pickup: GeoPoint, dropoff: GeoPoint) -> RouteEstimate {
        let Some(router) = &self.router else {
            return self.fallback.estimate(pickup, dropoff);
        };
        match tokio::time::timeout(
            self.route_timeout,
            router.distance_and_duration(pickup, dropoff),
        )
        .await
        {
            Ok(Ok(estimate)) => estimate,
            Ok(Err(err)) => {
                debug!(error = %err, "route provider failed, using straight-line estimate");
                self.fallback.estimate(pickup, dropoff)
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.route_timeout.as_millis() as u64,
                    "route provider timed out, using straight-line estimate"
                );
                self.fallback.estimate(pickup, dropoff)
            }
        }
    }

    pub async fn estimate(
        &self,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        vehicle_class: VehicleClass,
        surge_multiplier: f64,
    ) -> FareQuote {
        let route = self.route(pickup, dropoff).await;
        FareQuote {
            vehicle_class,
            distance_km: route.distance_km,
            duration_min: route.duration_min,
            surge_multiplier,
            amount: self.fare_for(
                vehicle_class,
                route.distance_km,
                route.duration_min,
                surge_multiplier,
            ),
            route_source: route.source,
        }
    }
}

/// Where a trip was when the rider cancelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancellationStage {
    /// No driver assigned yet.
    BeforeAssignment,
    /// Driver assigned or en route.
    Assigned { assigned_at_ms: u64 },
    /// Rider on board; `partial_fare` covers the distance and time so far.
    InTrip { partial_fare: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationPolicy {
    grace_window_ms: u64,
    flat_fee: f64,
}

impl CancellationPolicy {
    pub fn new(config: &CancellationConfig) -> Self {
        Self {
            grace_window_ms: config.grace_window_ms,
            flat_fee: config.flat_fee,
        }
    }

    pub fn fee(&self, stage: CancellationStage, now_ms: u64) -> f64 {
        match stage {
            CancellationStage::BeforeAssignment => 0.0,
            CancellationStage::Assigned { assigned_at_ms } => {
                if now_ms.saturating_sub(assigned_at_ms) <= self.grace_window_ms {
                    0.0
                } else {
                    self.flat_fee
                }
            }
            CancellationStage::InTrip { partial_fare } => {
                round_to_cents(partial_fare.max(self.flat_fee))
            }
        }
    }
}
