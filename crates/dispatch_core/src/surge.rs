//! Demand/supply aggregation per GeoCell and the surge step function.
//!
//! A GeoCell is an H3 cell at the surge resolution (default 7, ~5 km²). Demand is
//! the number of open trip requests whose pickup lies in the cell; supply is the
//! number of `online_idle` drivers in it. Counts move incrementally on every
//! relevant event and are periodically rebuilt from the driver index.

use std::collections::HashMap;

use dashmap::DashMap;
use h3o::{CellIndex, Resolution};
use serde::Serialize;

use crate::error::GeoIndexError;
use crate::model::GeoPoint;
use crate::spatial::cell_at;

pub type GeoCell = CellIndex;

/// `(ratio upper bound, multiplier)`, ordered and non-overlapping.
pub const SURGE_STEPS: [(f64, f64); 4] = [(0.5, 1.0), (1.0, 1.2), (2.0, 1.5), (4.0, 2.0)];

/// Multiplier for ratios at or above the last step bound.
pub const TOP_STEP_MULTIPLIER: f64 = 2.5;

/// Map a demand/supply ratio to a multiplier, never exceeding `cap`.
///
/// NaN ratios are treated as unbounded demand.
pub fn surge_for_ratio(ratio: f64, cap: f64) -> f64 {
    let step = SURGE_STEPS
        .iter()
        .find(|(upper, _)| ratio < *upper)
        .map(|(_, multiplier)| *multiplier)
        .unwrap_or(TOP_STEP_MULTIPLIER);
    step.min(cap)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CellCounts {
    pub demand: u32,
    pub supply: u32,
}

impl CellCounts {
    pub fn ratio(&self) -> f64 {
        match (self.demand, self.supply) {
            (0, _) => 0.0,
            (_, 0) => f64::INFINITY,
            (demand, supply) => demand as f64 / supply as f64,
        }
    }
}

#[derive(Debug)]
pub struct SurgeTracker {
    resolution: Resolution,
    cap: f64,
    cells: DashMap<GeoCell, CellCounts>,
}

impl SurgeTracker {
    pub fn new(resolution: Resolution, cap: f64) -> Self {
        Self {
            resolution,
            cap,
            cells: DashMap::new(),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn cap(&self) -> f64 {
        self.cap
    }

    pub fn cell_for(&self, point: GeoPoint) -> Result<GeoCell, GeoIndexError> {
        cell_at(point, self.resolution)
    }

    pub fn demand_opened(&self, cell: GeoCell) {
        self.cells.entry(cell).or_default().demand += 1;
    }

    pub fn demand_closed(&self, cell: GeoCell) {
        if let Some(mut counts) = self.cells.get_mut(&cell) {
            counts.demand = counts.demand.saturating_sub(1);
        }
    }

    pub fn supply_added(&self, cell: GeoCell) {
        self.cells.entry(cell).or_default().supply += 1;
    }

    pub fn supply_removed(&self, cell: GeoCell) {
        if let Some(mut counts) = self.cells.get_mut(&cell) {
            counts.supply = counts.supply.saturating_sub(1);
        }
    }

    /// Replace every cell's supply with a freshly computed count. Cells absent from
    /// `supply` drop to zero supply; demand is untouched.
    pub fn replace_supply(&self, supply: &HashMap<GeoCell, u32>) {
        for mut entry in self.cells.iter_mut() {
            entry.supply = supply.get(entry.key()).copied().unwrap_or(0);
        }
        for (cell, count) in supply {
            self.cells.entry(*cell).or_default().supply = *count;
        }
        self.cells
            .retain(|_, counts| counts.demand > 0 || counts.supply > 0);
    }

    pub fn counts(&self, cell: GeoCell) -> CellCounts {
        self.cells.get(&cell).map(|c| *c).unwrap_or_default()
    }

    pub fn current_surge(&self, cell: GeoCell) -> f64 {
        surge_for_ratio(self.counts(cell).ratio(), self.cap)
    }

    /// Surge for the cell containing `point`.
    pub fn surge_at(&self, point: GeoPoint) -> Result<(GeoCell, f64), GeoIndexError> {
        let cell = self.cell_for(point)?;
        Ok((cell, self.current_surge(cell)))
    }
}
