//! Live driver positions and radius queries.
//!
//! Layout:
//!
//! - **Driver arena**: `DriverId → DriverRecord`, the only copy of each record
//! - **Bucket levels**: one [`SpatialBuckets`] per configured H3 resolution (finest
//!   first), each mapping a cell to the ids of drivers inside it
//!
//! A query for radius `r` walks the finest level whose disk for `r` stays within
//! [`MAX_RING_K`] rings, falling back to coarser levels for wide radii.
//!
//! Lock order is always arena shard → bucket shard (→ surge cell). Queries copy ids
//! out of a bucket before touching the arena, so readers never hold both.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use h3o::Resolution;
use tracing::trace;

use crate::clock::Clock;
use crate::error::GeoIndexError;
use crate::model::{Availability, DriverId, DriverRecord, GeoPoint, VehicleClass};
use crate::spatial::{grid_disk_cached, haversine_km, ring_for_radius, SpatialBuckets, MAX_RING_K};
use crate::surge::SurgeTracker;

/// Index tuning derived from [`DispatchConfig`](crate::config::DispatchConfig).
#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Bucket resolutions, any order; sorted finest first on construction.
    pub resolutions: Vec<Resolution>,
    /// Radius escalation sequence in km, ascending.
    pub escalation_radii_km: Vec<f64>,
    /// Records older than this are invisible to queries.
    pub staleness_ms: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            resolutions: vec![Resolution::Nine, Resolution::Seven],
            escalation_radii_km: vec![0.5, 1.0, 2.0, 5.0],
            staleness_ms: 30_000,
        }
    }
}

/// A matching candidate returned by [`GeoIndex::query_nearby`].
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub position: GeoPoint,
    pub vehicle_class: VehicleClass,
    pub distance_km: f64,
}

#[derive(Debug)]
pub struct GeoIndex {
    drivers: DashMap<DriverId, DriverRecord>,
    levels: Vec<SpatialBuckets>,
    escalation_radii_km: Vec<f64>,
    staleness_ms: u64,
    clock: Arc<dyn Clock>,
    surge: Option<Arc<SurgeTracker>>,
}

impl GeoIndex {
    pub fn new(settings: IndexSettings, clock: Arc<dyn Clock>) -> Self {
        let mut resolutions = settings.resolutions;
        if resolutions.is_empty() {
            resolutions.push(Resolution::Nine);
        }
        // Finest (highest) resolution first.
        resolutions.sort_by(|a, b| u8::from(*b).cmp(&u8::from(*a)));
        resolutions.dedup();

        let mut radii = settings.escalation_radii_km;
        radii.retain(|r| r.is_finite() && *r > 0.0);
        radii.sort_by(f64::total_cmp);

        Self {
            drivers: DashMap::new(),
            levels: resolutions.into_iter().map(SpatialBuckets::new).collect(),
            escalation_radii_km: radii,
            staleness_ms: settings.staleness_ms,
            clock,
            surge: None,
        }
    }

    /// Keep the tracker's supply counts in step with idle drivers.
    pub fn with_surge(mut self, surge: Arc<SurgeTracker>) -> Self {
        self.surge = Some(surge);
        self
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn get(&self, driver_id: DriverId) -> Option<DriverRecord> {
        self.drivers.get(&driver_id).map(|r| r.clone())
    }

    /// Insert or move a driver. Unknown drivers are inserted as `online_idle`.
    ///
    /// Updates carrying a timestamp older than the stored one are ignored, so a
    /// redelivered position can never move a driver backwards.
    pub fn upsert(
        &self,
        driver_id: DriverId,
        vehicle_class: VehicleClass,
        point: GeoPoint,
        timestamp_ms: u64,
    ) -> Result<(), GeoIndexError> {
        self.upsert_as(
            driver_id,
            vehicle_class,
            point,
            timestamp_ms,
            Availability::OnlineIdle,
        )
    }

    /// Like [`upsert`](Self::upsert), inserting unknown drivers with `availability`.
    /// Known drivers keep their current availability.
    pub fn upsert_as(
        &self,
        driver_id: DriverId,
        vehicle_class: VehicleClass,
        point: GeoPoint,
        timestamp_ms: u64,
        availability: Availability,
    ) -> Result<(), GeoIndexError> {
        let point = GeoPoint::new(point.lat, point.lon)?;
        let new_cells = self
            .levels
            .iter()
            .map(|level| level.cell_for(point))
            .collect::<Result<Vec<_>, _>>()?;
        let new_surge_cell = self.surge.as_ref().map(|s| s.cell_for(point)).transpose()?;

        match self.drivers.entry(driver_id) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if timestamp_ms < record.updated_at_ms {
                    trace!(%driver_id, timestamp_ms, "ignoring out-of-order position");
                    return Ok(());
                }
                let old_point = record.position;
                for (level, new_cell) in self.levels.iter().zip(&new_cells) {
                    let old_cell = level.cell_for(old_point).ok();
                    level.relocate(driver_id, old_cell, *new_cell);
                }
                if record.availability == Availability::OnlineIdle {
                    if let (Some(surge), Some(new_cell)) = (&self.surge, new_surge_cell) {
                        let old_cell = surge.cell_for(old_point).ok();
                        if old_cell != Some(new_cell) {
                            if let Some(old_cell) = old_cell {
                                surge.supply_removed(old_cell);
                            }
                            surge.supply_added(new_cell);
                        }
                    }
                }
                record.position = point;
                record.vehicle_class = vehicle_class;
                record.updated_at_ms = timestamp_ms;
            }
            Entry::Vacant(vacant) => {
                for (level, cell) in self.levels.iter().zip(&new_cells) {
                    level.insert(driver_id, *cell);
                }
                if availability == Availability::OnlineIdle {
                    if let (Some(surge), Some(cell)) = (&self.surge, new_surge_cell) {
                        surge.supply_added(cell);
                    }
                }
                vacant.insert(DriverRecord {
                    driver_id,
                    position: point,
                    vehicle_class,
                    availability,
                    updated_at_ms: timestamp_ms,
                });
            }
        }
        Ok(())
    }

    /// Take a driver offline. Returns the removed record; removing twice is a no-op.
    pub fn remove(&self, driver_id: DriverId) -> Option<DriverRecord> {
        match self.drivers.entry(driver_id) {
            Entry::Occupied(occupied) => {
                let record = occupied.get();
                for level in &self.levels {
                    if let Ok(cell) = level.cell_for(record.position) {
                        level.remove(driver_id, cell);
                    }
                }
                if record.availability == Availability::OnlineIdle {
                    self.adjust_supply(record.position, false);
                }
                Some(occupied.remove())
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Unconditionally set availability. Returns `false` for unknown drivers.
    pub fn set_availability(&self, driver_id: DriverId, availability: Availability) -> bool {
        let Some(mut record) = self.drivers.get_mut(&driver_id) else {
            return false;
        };
        self.transition_availability(record.value_mut(), availability);
        true
    }

    /// Set availability only if it currently equals `expected`.
    pub fn compare_and_set_availability(
        &self,
        driver_id: DriverId,
        expected: Availability,
        availability: Availability,
    ) -> bool {
        let Some(mut record) = self.drivers.get_mut(&driver_id) else {
            return false;
        };
        if record.availability != expected {
            return false;
        }
        self.transition_availability(record.value_mut(), availability);
        true
    }

    fn transition_availability(&self, record: &mut DriverRecord, availability: Availability) {
        let was_idle = record.availability == Availability::OnlineIdle;
        let is_idle = availability == Availability::OnlineIdle;
        if was_idle != is_idle {
            self.adjust_supply(record.position, is_idle);
        }
        record.availability = availability;
    }

    fn adjust_supply(&self, point: GeoPoint, added: bool) {
        let Some(surge) = &self.surge else {
            return;
        };
        if let Ok(cell) = surge.cell_for(point) {
            if added {
                surge.supply_added(cell);
            } else {
                surge.supply_removed(cell);
            }
        }
    }

    /// Idle drivers of `vehicle_class` within `radius_km`, nearest first.
    ///
    /// The radius escalates through the configured steps below `radius_km` and stops
    /// at the first step yielding `max_results` candidates. Returning fewer (or none)
    /// is the normal "not enough drivers" outcome.
    pub fn query_nearby(
        &self,
        point: GeoPoint,
        vehicle_class: VehicleClass,
        max_results: usize,
        radius_km: f64,
    ) -> Result<Vec<Candidate>, GeoIndexError> {
        self.query_nearby_excluding(point, vehicle_class, max_results, radius_km, &HashSet::new())
    }

    /// [`query_nearby`](Self::query_nearby) skipping drivers in `excluded`.
    pub fn query_nearby_excluding(
        &self,
        point: GeoPoint,
        vehicle_class: VehicleClass,
        max_results: usize,
        radius_km: f64,
        excluded: &HashSet<DriverId>,
    ) -> Result<Vec<Candidate>, GeoIndexError> {
        let point = GeoPoint::new(point.lat, point.lon)?;
        if max_results == 0 {
            return Ok(Vec::new());
        }
        let now_ms = self.clock.now_ms();

        let mut found = Vec::new();
        for step_km in self.escalation_steps(radius_km) {
            found = self.candidates_within(point, vehicle_class, step_km, now_ms, excluded)?;
            if found.len() >= max_results {
                break;
            }
        }
        found.truncate(max_results);
        Ok(found)
    }

    fn escalation_steps(&self, radius_km: f64) -> Vec<f64> {
        let mut steps: Vec<f64> = self
            .escalation_radii_km
            .iter()
            .copied()
            .filter(|r| *r < radius_km)
            .collect();
        steps.push(radius_km.max(0.0));
        steps
    }

    fn level_for(&self, radius_km: f64) -> (&SpatialBuckets, u32) {
        for level in &self.levels {
            let k = ring_for_radius(level.resolution(), radius_km);
            if k <= MAX_RING_K {
                return (level, k);
            }
        }
        // `new` guarantees at least one level.
        let coarsest = &self.levels[self.levels.len() - 1];
        (coarsest, ring_for_radius(coarsest.resolution(), radius_km))
    }

    fn candidates_within(
        &self,
        point: GeoPoint,
        vehicle_class: VehicleClass,
        radius_km: f64,
        now_ms: u64,
        excluded: &HashSet<DriverId>,
    ) -> Result<Vec<Candidate>, GeoIndexError> {
        let (level, k) = self.level_for(radius_km);
        let origin = level.cell_for(point)?;
        let cells = grid_disk_cached(origin, k);

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for driver_id in level.drivers_in_cells(&cells) {
            if excluded.contains(&driver_id) || !seen.insert(driver_id) {
                continue;
            }
            let Some(record) = self.drivers.get(&driver_id) else {
                continue;
            };
            if record.vehicle_class != vehicle_class
                || record.availability != Availability::OnlineIdle
                || record.is_stale(now_ms, self.staleness_ms)
            {
                continue;
            }
            let distance_km = haversine_km(point, record.position);
            if distance_km <= radius_km {
                candidates.push(Candidate {
                    driver_id,
                    position: record.position,
                    vehicle_class: record.vehicle_class,
                    distance_km,
                });
            }
        }
        candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        Ok(candidates)
    }

    /// Recompute surge supply from scratch, counting only fresh idle drivers.
    /// Returns the number of drivers counted.
    pub fn refresh_supply(&self) -> usize {
        let Some(surge) = &self.surge else {
            return 0;
        };
        let now_ms = self.clock.now_ms();
        let mut supply: HashMap<_, u32> = HashMap::new();
        let mut counted = 0;
        for record in self.drivers.iter() {
            if record.availability != Availability::OnlineIdle
                || record.is_stale(now_ms, self.staleness_ms)
            {
                continue;
            }
            if let Ok(cell) = surge.cell_for(record.position) {
                *supply.entry(cell).or_insert(0) += 1;
                counted += 1;
            }
        }
        surge.replace_supply(&supply);
        counted
    }

    /// Drop drivers whose last update is older than `max_age_ms`.
    pub fn purge_older_than(&self, max_age_ms: u64) -> usize {
        let now_ms = self.clock.now_ms();
        let expired: Vec<DriverId> = self
            .drivers
            .iter()
            .filter(|r| r.availability != Availability::OnTrip && r.is_stale(now_ms, max_age_ms))
            .map(|r| r.driver_id)
            .collect();
        expired
            .into_iter()
            .filter(|id| self.remove(*id).is_some())
            .count()
    }
}
