//! Error taxonomy.
//!
//! Each component has its own error enum. [`DispatchError`] is the crate-level
//! classification callers act on:
//!
//! - `NoMatch`: terminal, expected ("no drivers available")
//! - `LeaseContention`: transient, expected, move on to the next candidate
//! - `TransportTimeout`: transient, retried with bounded backoff then skipped
//! - `StorageUnavailable`: fatal for the in-flight operation, the only one alerted on

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DriverId, TripId};
use crate::trip::TripState;

/// Why a trip ended in `no_match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// Radius escalation found nobody at all.
    NoDriversAvailable,
    /// Every escalation round expired without a successful accept.
    EscalationExhausted,
    /// The total search budget elapsed.
    SearchTimeout,
    /// The lease store stayed unreachable beyond the grace period.
    SystemError,
}

impl fmt::Display for NoMatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NoMatchReason::NoDriversAvailable => "no drivers available",
            NoMatchReason::EscalationExhausted => "no driver accepted",
            NoMatchReason::SearchTimeout => "search timed out",
            NoMatchReason::SystemError => "system error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoIndexError {
    #[error("invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("invalid H3 resolution {0}")]
    InvalidResolution(u8),
}

/// Failure talking to the shared key-value store behind the lease.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lease store {op} timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },

    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => LockError::Unavailable(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("realtime channel timed out")]
    Timeout,

    #[error("endpoint disconnected: {0}")]
    Disconnected(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no route between the given points")]
    NoRoute,

    #[error("routing service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TripError {
    #[error("unknown trip {0}")]
    UnknownTrip(TripId),

    #[error("{trip}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        trip: TripId,
        from: TripState,
        to: TripState,
    },

    #[error("{trip} has no assigned driver")]
    NoDriver { trip: TripId },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} in environment variable {var}")]
    Env { var: &'static str, value: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no match: {0}")]
    NoMatch(NoMatchReason),

    #[error("{driver} is already leased to another trip")]
    LeaseContention { driver: DriverId },

    #[error("transport timed out after {attempts} attempt(s)")]
    TransportTimeout { attempts: u32 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Geo(#[from] GeoIndexError),

    #[error(transparent)]
    Trip(#[from] TripError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<LockError> for DispatchError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { .. } => DispatchError::TransportTimeout { attempts: 1 },
            LockError::Unavailable(message) => DispatchError::StorageUnavailable(message),
        }
    }
}

impl DispatchError {
    /// Transient failures are retried or skipped, never surfaced as faults.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::LeaseContention { .. } | DispatchError::TransportTimeout { .. }
        )
    }
}
