pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod geo_index;
pub mod lease;
pub mod matching;
pub mod model;
pub mod persistence;
pub mod pricing;
pub mod retry;
pub mod routing;
pub mod spatial;
pub mod surge;
pub mod telemetry;
pub mod traffic;
pub mod trip;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::DispatchConfig;
pub use error::{DispatchError, NoMatchReason};
pub use matching::{EngineBuilder, MatchOutcome, MatchingEngine, ResponseOutcome};
pub use model::{Availability, DriverId, GeoPoint, RiderId, TripId, VehicleClass};
pub use trip::{Trip, TripRequest, TripState};
