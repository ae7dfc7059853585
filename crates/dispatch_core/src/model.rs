//! Core identifiers and records shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GeoIndexError;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Driver identity. Ordering is used to break distance ties deterministically.
    DriverId,
    "driver"
);
id_type!(TripId, "trip");
id_type!(RiderId, "rider");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Economy,
    Premium,
    Xl,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 3] = [VehicleClass::Economy, VehicleClass::Premium, VehicleClass::Xl];
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VehicleClass::Economy => "economy",
            VehicleClass::Premium => "premium",
            VehicleClass::Xl => "xl",
        };
        f.write_str(name)
    }
}

/// Driver availability as seen by matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Offline,
    OnlineIdle,
    OfferPending,
    OnTrip,
}

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Validated constructor. Rejects non-finite and out-of-range values.
    pub fn new(lat: f64, lon: f64) -> Result<Self, GeoIndexError> {
        if !lat.is_finite() || !lon.is_finite() || !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(GeoIndexError::InvalidCoordinate { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        crate::spatial::haversine_km(*self, *other)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.lat, self.lon)
    }
}

/// Current state of one driver, owned by the [`GeoIndex`](crate::geo_index::GeoIndex).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub vehicle_class: VehicleClass,
    pub availability: Availability,
    /// Unix ms of the last position update.
    pub updated_at_ms: u64,
}

impl DriverRecord {
    /// True when the last update is older than `staleness_ms` at `now_ms`.
    pub fn is_stale(&self, now_ms: u64, staleness_ms: u64) -> bool {
        now_ms.saturating_sub(self.updated_at_ms) > staleness_ms
    }
}
