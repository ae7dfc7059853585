//! Exclusive driver assignment over a shared key-value store.
//!
//! Mutual exclusion rests entirely on the store's conditional write
//! ([`LeaseStore::put_if_vacant`]): the client never reads a key and then writes
//! it. Every store round trip is bounded by a timeout; a timeout is a transient
//! outcome for that call, not evidence about who holds the lease.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{LockError, StoreError};
use crate::model::{DriverId, TripId};

/// Key-value operations the lease needs. Each must be atomic in the backing store
/// (e.g. `SET key value NX PX ttl` and Lua compare-and-delete in Redis).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Write `holder` under `key` if the key is absent or expired. Returns `true`
    /// when `holder` holds the key afterwards; re-acquiring an own live lease
    /// succeeds without changing its expiry.
    async fn put_if_vacant(&self, key: &str, holder: &str, ttl_ms: u64)
        -> Result<bool, StoreError>;

    /// Delete `key` only while `holder` still holds it.
    async fn delete_if_holder(&self, key: &str, holder: &str) -> Result<bool, StoreError>;

    /// Push the expiry of a live lease out to now + `ttl_ms`, only while `holder` holds it.
    async fn extend_if_holder(&self, key: &str, holder: &str, ttl_ms: u64)
        -> Result<bool, StoreError>;

    /// Current live holder of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    expires_at_ms: u64,
}

/// Single-process [`LeaseStore`]. Each key's shard lock makes the conditional
/// operations atomic.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    entries: DashMap<String, LeaseEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of keys with an unexpired lease.
    pub fn live_leases(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.entries
            .iter()
            .filter(|e| e.expires_at_ms > now_ms)
            .count()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at_ms > now_ms);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn put_if_vacant(
        &self,
        key: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_ms();
        let fresh = LeaseEntry {
            holder: holder.to_string(),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.expires_at_ms > now_ms {
                    return Ok(current.holder == holder);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete_if_holder(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_ms();
        let removed = self
            .entries
            .remove_if(key, |_, e| e.holder == holder && e.expires_at_ms > now_ms);
        Ok(removed.is_some())
    }

    async fn extend_if_holder(
        &self,
        key: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_ms();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.holder == holder && entry.expires_at_ms > now_ms => {
                entry.expires_at_ms = now_ms.saturating_add(ttl_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.expires_at_ms > now_ms)
            .map(|e| e.holder.clone()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AssignmentLock
// ---------------------------------------------------------------------------

/// Driver → trip lease on top of a [`LeaseStore`].
#[derive(Clone)]
pub struct AssignmentLock {
    store: Arc<dyn LeaseStore>,
    timeout: Duration,
}

impl AssignmentLock {
    pub fn new(store: Arc<dyn LeaseStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn lease_key(driver_id: DriverId) -> String {
        format!("dispatch:lease:{driver_id}")
    }

    fn holder_value(trip_id: TripId) -> String {
        trip_id.0.to_string()
    }

    /// Atomically bind `driver_id` to `trip_id`. `Ok(false)` means another trip
    /// holds a live lease on the driver.
    pub async fn try_acquire(
        &self,
        driver_id: DriverId,
        trip_id: TripId,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let key = Self::lease_key(driver_id);
        let holder = Self::holder_value(trip_id);
        let acquired = self
            .bounded(
                "put_if_vacant",
                self.store
                    .put_if_vacant(&key, &holder, ttl.as_millis() as u64),
            )
            .await?;
        trace!(%driver_id, %trip_id, acquired, "lease acquire");
        Ok(acquired)
    }

    /// Release the lease if `trip_id` still holds it. Never frees a newer lease
    /// held by another trip.
    pub async fn release(&self, driver_id: DriverId, trip_id: TripId) -> Result<bool, LockError> {
        let key = Self::lease_key(driver_id);
        let holder = Self::holder_value(trip_id);
        let released = self
            .bounded("delete_if_holder", self.store.delete_if_holder(&key, &holder))
            .await?;
        if !released {
            debug!(%driver_id, %trip_id, "release skipped, lease not held by trip");
        }
        Ok(released)
    }

    /// Extend a live lease held by `trip_id`. `Ok(false)` when it lapsed or moved on.
    pub async fn renew(
        &self,
        driver_id: DriverId,
        trip_id: TripId,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let key = Self::lease_key(driver_id);
        let holder = Self::holder_value(trip_id);
        self.bounded(
            "extend_if_holder",
            self.store
                .extend_if_holder(&key, &holder, ttl.as_millis() as u64),
        )
        .await
    }

    pub async fn holder(&self, driver_id: DriverId) -> Result<Option<TripId>, LockError> {
        let key = Self::lease_key(driver_id);
        let value = self.bounded("get", self.store.get(&key)).await?;
        Ok(value.and_then(|v| v.parse::<u64>().ok()).map(TripId))
    }

    pub async fn ping(&self) -> Result<(), LockError> {
        self.bounded("ping", self.store.ping()).await
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, LockError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(LockError::from),
            Err(_) => Err(LockError::Timeout {
                op,
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
