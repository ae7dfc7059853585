pub mod engine;
pub mod offer;
mod search;
pub mod types;

pub use engine::{BackgroundTasks, EngineBuilder, MatchingEngine};
pub use offer::{Offer, OfferBook, OfferStatus};
pub use types::{estimate_pickup_eta_ms, MatchCandidate, MatchOutcome, ResponseOutcome, TripTicket};
