//! Spatial primitives: H3 cell bucketing and great-circle distances.
//!
//! This module provides:
//!
//! - **Haversine distance** between coordinates
//! - **Cell helpers**: point → cell at a resolution, ring size needed to cover a radius
//! - **Grid disk cache**: LRU of `(origin, k)` → cells, shared by all queries
//! - **SpatialBuckets**: one level of H3 cell → driver id buckets
//!
//! Buckets hold identities only; the records themselves live in the driver arena of
//! [`GeoIndex`](crate::geo_index::GeoIndex).

use std::num::NonZeroUsize;
use std::sync::OnceLock;

use dashmap::DashMap;
use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::GeoIndexError;
use crate::model::{DriverId, GeoPoint};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Largest ring we are willing to enumerate on one level before moving to a coarser one.
pub const MAX_RING_K: u32 = 12;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlon = ((lon2 - lon1) * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn resolution_from_u8(value: u8) -> Result<Resolution, GeoIndexError> {
    Resolution::try_from(value).map_err(|_| GeoIndexError::InvalidResolution(value))
}

pub fn cell_at(point: GeoPoint, resolution: Resolution) -> Result<CellIndex, GeoIndexError> {
    LatLng::new(point.lat, point.lon)
        .map(|ll| ll.to_cell(resolution))
        .map_err(|_| GeoIndexError::InvalidCoordinate {
            lat: point.lat,
            lon: point.lon,
        })
}

pub fn cell_center(cell: CellIndex) -> GeoPoint {
    let ll: LatLng = cell.into();
    GeoPoint {
        lat: ll.lat(),
        lon: ll.lng(),
    }
}

/// Grid distance `k` whose disk is guaranteed to contain every point within `radius_km`.
///
/// Ring spacing is about `sqrt(3)` edges; we budget 0.75 edge per ring because cell
/// size varies across the globe, plus one ring for the origin's own offset.
pub fn ring_for_radius(resolution: Resolution, radius_km: f64) -> u32 {
    let per_ring_km = resolution.edge_length_km() * 0.75;
    if radius_km <= 0.0 || per_ring_km <= 0.0 {
        return 1;
    }
    (radius_km / per_ring_km).ceil() as u32 + 1
}

// ---------------------------------------------------------------------------
// Grid disk cache
// ---------------------------------------------------------------------------

struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(4_096).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        self.cache
            .lock()
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

static GRID_DISK_CACHE: OnceLock<GridDiskCache> = OnceLock::new();

/// Cells within grid distance `k` of `origin`, memoised.
pub fn grid_disk_cached(origin: CellIndex, k: u32) -> Vec<CellIndex> {
    GRID_DISK_CACHE
        .get_or_init(GridDiskCache::new)
        .get_or_compute(origin, k)
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// One resolution level of cell → driver id buckets.
///
/// Each bucket sits behind its own shard lock, so moving a driver between two
/// cells never blocks queries touching other cells.
#[derive(Debug)]
pub struct SpatialBuckets {
    resolution: Resolution,
    buckets: DashMap<CellIndex, Vec<DriverId>>,
}

impl SpatialBuckets {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            buckets: DashMap::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn cell_for(&self, point: GeoPoint) -> Result<CellIndex, GeoIndexError> {
        cell_at(point, self.resolution)
    }

    pub fn insert(&self, driver: DriverId, cell: CellIndex) {
        let mut bucket = self.buckets.entry(cell).or_default();
        if !bucket.contains(&driver) {
            bucket.push(driver);
        }
    }

    pub fn remove(&self, driver: DriverId, cell: CellIndex) {
        // The guard must be gone before `remove_if` touches the same shard.
        let now_empty = match self.buckets.get_mut(&cell) {
            Some(mut bucket) => {
                bucket.retain(|d| *d != driver);
                bucket.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.buckets.remove_if(&cell, |_, bucket| bucket.is_empty());
        }
    }

    /// Move a driver between cells. No-op when the cell did not change.
    pub fn relocate(&self, driver: DriverId, old_cell: Option<CellIndex>, new_cell: CellIndex) {
        if old_cell == Some(new_cell) {
            return;
        }
        if let Some(old) = old_cell {
            self.remove(driver, old);
        }
        self.insert(driver, new_cell);
    }

    /// Driver ids in the given cells. Guards are released before returning.
    pub fn drivers_in_cells(&self, cells: &[CellIndex]) -> Vec<DriverId> {
        let mut result = Vec::new();
        for cell in cells {
            if let Some(bucket) = self.buckets.get(cell) {
                result.extend(bucket.iter().copied());
            }
        }
        result
    }

    pub fn occupied_cells(&self) -> usize {
        self.buckets.len()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf() -> GeoPoint {
        GeoPoint {
            lat: 37.7749,
            lon: -122.4194,
        }
    }

    #[test]
    fn haversine_matches_known_distance() {
        // San Francisco → Los Angeles is roughly 559 km.
        let la = GeoPoint {
            lat: 34.0522,
            lon: -118.2437,
        };
        let distance = haversine_km(sf(), la);
        assert!((distance - 559.0).abs() < 5.0, "got {distance}");
        assert_eq!(haversine_km(sf(), sf()), 0.0);
    }

    #[test]
    fn ring_covers_radius() {
        let origin = cell_at(sf(), Resolution::Nine).expect("cell");
        let k = ring_for_radius(Resolution::Nine, 0.5);
        let disk = grid_disk_cached(origin, k);

        // A point 0.45 km east must land in one of the disk cells.
        let east = GeoPoint {
            lat: sf().lat,
            lon: sf().lon + 0.45 / (111.32 * sf().lat.to_radians().cos()),
        };
        assert!(haversine_km(sf(), east) < 0.5);
        let target = cell_at(east, Resolution::Nine).expect("cell");
        assert!(disk.contains(&target));
    }

    #[test]
    fn buckets_relocate_and_drop_empty_cells() {
        let buckets = SpatialBuckets::new(Resolution::Nine);
        let a = cell_at(sf(), Resolution::Nine).expect("cell");
        let b = a
            .grid_disk::<Vec<_>>(1)
            .into_iter()
            .find(|c| *c != a)
            .expect("neighbor");

        buckets.insert(DriverId(1), a);
        buckets.insert(DriverId(1), a);
        assert_eq!(buckets.drivers_in_cells(&[a]), vec![DriverId(1)]);

        buckets.relocate(DriverId(1), Some(a), b);
        assert!(buckets.drivers_in_cells(&[a]).is_empty());
        assert_eq!(buckets.drivers_in_cells(&[b]), vec![DriverId(1)]);
        assert_eq!(buckets.occupied_cells(), 1);

        buckets.remove(DriverId(1), b);
        assert_eq!(buckets.occupied_cells(), 0);
    }

    #[test]
    fn invalid_resolution_is_rejected() {
        assert!(resolution_from_u8(9).is_ok());
        assert_eq!(
            resolution_from_u8(16),
            Err(GeoIndexError::InvalidResolution(16))
        );
    }
}
