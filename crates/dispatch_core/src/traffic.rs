//! Time-of-day average speeds for straight-line duration estimates.
//!
//! Only used when no routing service answers; a real router already accounts for
//! traffic in the durations it returns.

use serde::{Deserialize, Serialize};

use crate::clock::ONE_HOUR_MS;

/// Average city speed in km/h for each hour of the day (index 0 = midnight, local time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub hourly_kmh: [f64; 24],
}

impl SpeedProfile {
    /// Same speed around the clock.
    pub fn flat(kmh: f64) -> Self {
        Self {
            hourly_kmh: [kmh; 24],
        }
    }

    /// Typical dense-city pattern.
    ///
    /// - 00–06: 35 km/h (free flow)
    /// - 07–09: 18 km/h (morning rush)
    /// - 09–16: 25 km/h (midday)
    /// - 16–19: 17 km/h (evening rush)
    /// - 19–24: 28 km/h (evening)
    pub fn city() -> Self {
        let mut kmh = [35.0_f64; 24];
        for slot in &mut kmh[7..9] {
            *slot = 18.0;
        }
        for slot in &mut kmh[9..16] {
            *slot = 25.0;
        }
        for slot in &mut kmh[16..19] {
            *slot = 17.0;
        }
        for slot in &mut kmh[19..24] {
            *slot = 28.0;
        }
        Self { hourly_kmh: kmh }
    }

    /// Local hour of day for a unix timestamp shifted by `utc_offset_minutes`.
    pub fn hour_of_day(unix_ms: u64, utc_offset_minutes: i32) -> usize {
        let local_ms = unix_ms as i64 + utc_offset_minutes as i64 * 60_000;
        (local_ms.div_euclid(ONE_HOUR_MS as i64) % 24) as usize
    }

    /// Speed bucket at the given time, floored at 1 km/h.
    pub fn speed_at(&self, unix_ms: u64, utc_offset_minutes: i32) -> f64 {
        self.hourly_kmh[Self::hour_of_day(unix_ms, utc_offset_minutes)].max(1.0)
    }
}

impl Default for SpeedProfile {
    fn default() -> Self {
        Self::city()
    }
}
