//! Hand-off of terminal trips to durable storage.
//!
//! Writes are fire-and-forget from the engine's point of view: a spawned task
//! retries with bounded backoff and logs if it finally gives up.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::trip::Trip;

#[async_trait]
pub trait TripPersistence: Send + Sync {
    async fn persist(&self, trip: &Trip) -> Result<(), PersistError>;
}

/// Drops every record. Default when no store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl TripPersistence for NoopPersistence {
    async fn persist(&self, _trip: &Trip) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Persist `trip` on a background task. Outside a runtime the record is dropped
/// with a warning.
pub fn persist_in_background(
    persistence: Arc<dyn TripPersistence>,
    trip: Trip,
    policy: RetryPolicy,
) {
    let Ok(handle) = Handle::try_current() else {
        warn!(trip_id = %trip.trip_id, "no runtime, terminal trip not persisted");
        return;
    };
    handle.spawn(async move {
        let trip_id = trip.trip_id;
        let (store, record) = (&persistence, &trip);
        let result = retry_with_backoff(
            &policy,
            "persist_trip",
            |_: &PersistError| true,
            || store.persist(record),
        )
        .await;
        match result {
            Ok(()) => debug!(%trip_id, state = ?trip.state, "trip persisted"),
            Err((err, attempts)) => {
                warn!(%trip_id, attempts, error = %err, "giving up on trip persistence")
            }
        }
    });
}
