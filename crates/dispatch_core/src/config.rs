//! Engine configuration.
//!
//! Every field has a default, so a JSON document only needs the values it changes.
//! `DISPATCH_*` environment variables override individual scalar fields on top of
//! the JSON, and [`DispatchConfig::validate`] runs last.

use std::str::FromStr;
use std::time::Duration;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::geo_index::IndexSettings;
use crate::model::VehicleClass;
use crate::retry::RetryPolicy;
use crate::routing::RouteProviderKind;
use crate::spatial::resolution_from_u8;
use crate::traffic::SpeedProfile;

/// Per-class fare components in currency units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassRates {
    pub base: f64,
    pub per_km: f64,
    pub per_minute: f64,
    pub minimum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub economy: ClassRates,
    pub premium: ClassRates,
    pub xl: ClassRates,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            economy: ClassRates {
                base: 2.50,
                per_km: 1.50,
                per_minute: 0.30,
                minimum: 7.00,
            },
            premium: ClassRates {
                base: 5.00,
                per_km: 2.75,
                per_minute: 0.55,
                minimum: 15.00,
            },
            xl: ClassRates {
                base: 4.00,
                per_km: 2.25,
                per_minute: 0.45,
                minimum: 10.00,
            },
        }
    }
}

impl PricingConfig {
    pub fn rates_for(&self, class: VehicleClass) -> ClassRates {
        match class {
            VehicleClass::Economy => self.economy,
            VehicleClass::Premium => self.premium,
            VehicleClass::Xl => self.xl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Free cancellation window after assignment.
    pub grace_window_ms: u64,
    /// Fee after the grace window; also the floor of in-trip cancellation fares.
    pub flat_fee: f64,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: 120_000,
            flat_fee: 5.00,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Drivers offered a trip per escalation round (K).
    pub candidate_fan_out: usize,
    pub offer_ttl_ms: u64,
    /// Radius escalation sequence in km, ascending.
    pub escalation_radii_km: Vec<f64>,
    pub max_escalation_rounds: u32,
    /// Total search budget per trip.
    pub max_search_duration_ms: u64,
    pub driver_staleness_ms: u64,
    pub surge_cap: f64,
    pub surge_cell_resolution: u8,
    pub surge_refresh_interval_ms: u64,
    /// Spatial bucket resolutions of the driver index.
    pub index_resolutions: Vec<u8>,
    pub lease_ttl_ms: u64,
    /// Bound on each lease store round trip.
    pub store_timeout_ms: u64,
    /// Bound on each realtime channel send.
    pub transport_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// How long the store may stay unreachable before searching trips give up.
    pub storage_failure_grace_ms: u64,
    /// Mark offered drivers `offer_pending` so concurrent trips skip them.
    pub exclusive_offers: bool,
    pub assignment_sweep_interval_ms: u64,
    pub pricing: PricingConfig,
    pub cancellation: CancellationConfig,
    /// Terminal trips kept for late lookups.
    pub archive_capacity: usize,
    pub route_provider: RouteProviderKind,
    pub speed_profile: SpeedProfile,
    /// Local time offset used for the hour-of-day speed buckets.
    pub utc_offset_minutes: i32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            candidate_fan_out: 3,
            offer_ttl_ms: 15_000,
            escalation_radii_km: vec![0.5, 1.0, 2.0, 5.0],
            max_escalation_rounds: 3,
            max_search_duration_ms: 90_000,
            driver_staleness_ms: 30_000,
            surge_cap: 2.5,
            surge_cell_resolution: 7,
            surge_refresh_interval_ms: 60_000,
            index_resolutions: vec![9, 7],
            lease_ttl_ms: 120_000,
            store_timeout_ms: 500,
            transport_timeout_ms: 1_000,
            retry: RetryPolicy::default(),
            storage_failure_grace_ms: 10_000,
            exclusive_offers: false,
            assignment_sweep_interval_ms: 5_000,
            pricing: PricingConfig::default(),
            cancellation: CancellationConfig::default(),
            archive_capacity: 10_000,
            route_provider: RouteProviderKind::default(),
            speed_profile: SpeedProfile::default(),
            utc_offset_minutes: 0,
        }
    }
}

impl DispatchConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DISPATCH_*` overrides from the process environment, then validate.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup, then validate.
    pub fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        override_field(&lookup, "DISPATCH_CANDIDATE_FAN_OUT", &mut self.candidate_fan_out)?;
        override_field(&lookup, "DISPATCH_OFFER_TTL_MS", &mut self.offer_ttl_ms)?;
        override_field(
            &lookup,
            "DISPATCH_MAX_ESCALATION_ROUNDS",
            &mut self.max_escalation_rounds,
        )?;
        override_field(
            &lookup,
            "DISPATCH_MAX_SEARCH_DURATION_MS",
            &mut self.max_search_duration_ms,
        )?;
        override_field(&lookup, "DISPATCH_DRIVER_STALENESS_MS", &mut self.driver_staleness_ms)?;
        override_field(&lookup, "DISPATCH_SURGE_CAP", &mut self.surge_cap)?;
        override_field(&lookup, "DISPATCH_LEASE_TTL_MS", &mut self.lease_ttl_ms)?;
        override_field(&lookup, "DISPATCH_STORE_TIMEOUT_MS", &mut self.store_timeout_ms)?;
        override_field(
            &lookup,
            "DISPATCH_TRANSPORT_TIMEOUT_MS",
            &mut self.transport_timeout_ms,
        )?;
        override_field(
            &lookup,
            "DISPATCH_STORAGE_FAILURE_GRACE_MS",
            &mut self.storage_failure_grace_ms,
        )?;
        override_field(&lookup, "DISPATCH_EXCLUSIVE_OFFERS", &mut self.exclusive_offers)?;
        override_field(&lookup, "DISPATCH_UTC_OFFSET_MINUTES", &mut self.utc_offset_minutes)?;

        const RADII_VAR: &str = "DISPATCH_ESCALATION_RADII_KM";
        if let Some(raw) = lookup(RADII_VAR) {
            self.escalation_radii_km = raw
                .split(',')
                .map(|part| part.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|_| ConfigError::Env {
                    var: RADII_VAR,
                    value: raw.clone(),
                })?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidate_fan_out == 0 {
            return Err(ConfigError::invalid("candidate_fan_out", "must be at least 1"));
        }
        if self.offer_ttl_ms == 0 {
            return Err(ConfigError::invalid("offer_ttl_ms", "must be positive"));
        }
        if self.escalation_radii_km.is_empty() {
            return Err(ConfigError::invalid("escalation_radii_km", "must not be empty"));
        }
        if self
            .escalation_radii_km
            .iter()
            .any(|r| !r.is_finite() || *r <= 0.0)
        {
            return Err(ConfigError::invalid(
                "escalation_radii_km",
                "radii must be finite and positive",
            ));
        }
        if self.escalation_radii_km.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid(
                "escalation_radii_km",
                "radii must be strictly ascending",
            ));
        }
        if self.max_escalation_rounds == 0 {
            return Err(ConfigError::invalid("max_escalation_rounds", "must be at least 1"));
        }
        if !self.surge_cap.is_finite() || self.surge_cap < 1.0 {
            return Err(ConfigError::invalid("surge_cap", "must be a finite value >= 1.0"));
        }
        if self.index_resolutions.is_empty() {
            return Err(ConfigError::invalid("index_resolutions", "must not be empty"));
        }
        for res in &self.index_resolutions {
            resolution_from_u8(*res)
                .map_err(|e| ConfigError::invalid("index_resolutions", e.to_string()))?;
        }
        resolution_from_u8(self.surge_cell_resolution)
            .map_err(|e| ConfigError::invalid("surge_cell_resolution", e.to_string()))?;
        for (field, value) in [
            ("lease_ttl_ms", self.lease_ttl_ms),
            ("store_timeout_ms", self.store_timeout_ms),
            ("transport_timeout_ms", self.transport_timeout_ms),
            ("surge_refresh_interval_ms", self.surge_refresh_interval_ms),
            ("assignment_sweep_interval_ms", self.assignment_sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        for class in VehicleClass::ALL {
            let rates = self.pricing.rates_for(class);
            if [rates.base, rates.per_km, rates.per_minute, rates.minimum]
                .iter()
                .any(|v| !v.is_finite() || *v < 0.0)
            {
                return Err(ConfigError::invalid(
                    "pricing",
                    format!("{class} rates must be finite and non-negative"),
                ));
            }
        }
        if !self.cancellation.flat_fee.is_finite() || self.cancellation.flat_fee < 0.0 {
            return Err(ConfigError::invalid(
                "cancellation.flat_fee",
                "must be finite and non-negative",
            ));
        }
        if self.archive_capacity == 0 {
            return Err(ConfigError::invalid("archive_capacity", "must be at least 1"));
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::invalid("utc_offset_minutes", "must be within ±14h"));
        }
        Ok(())
    }

    pub fn with_candidate_fan_out(mut self, k: usize) -> Self {
        self.candidate_fan_out = k;
        self
    }

    pub fn with_offer_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.offer_ttl_ms = ttl_ms;
        self
    }

    pub fn with_max_escalation_rounds(mut self, rounds: u32) -> Self {
        self.max_escalation_rounds = rounds;
        self
    }

    pub fn with_exclusive_offers(mut self, exclusive: bool) -> Self {
        self.exclusive_offers = exclusive;
        self
    }

    pub fn with_speed_profile(mut self, speed_profile: SpeedProfile) -> Self {
        self.speed_profile = speed_profile;
        self
    }

    pub fn index_settings(&self) -> Result<IndexSettings, ConfigError> {
        let resolutions = self
            .index_resolutions
            .iter()
            .map(|r| resolution_from_u8(*r))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::invalid("index_resolutions", e.to_string()))?;
        Ok(IndexSettings {
            resolutions,
            escalation_radii_km: self.escalation_radii_km.clone(),
            staleness_ms: self.driver_staleness_ms,
        })
    }

    pub fn surge_resolution(&self) -> Result<Resolution, ConfigError> {
        resolution_from_u8(self.surge_cell_resolution)
            .map_err(|e| ConfigError::invalid("surge_cell_resolution", e.to_string()))
    }

    /// Widest radius the search escalates to.
    pub fn max_radius_km(&self) -> f64 {
        self.escalation_radii_km.last().copied().unwrap_or(0.0)
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::from_millis(self.offer_ttl_ms)
    }

    pub fn max_search_duration(&self) -> Duration {
        Duration::from_millis(self.max_search_duration_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn storage_failure_grace(&self) -> Duration {
        Duration::from_millis(self.storage_failure_grace_ms)
    }
}

fn override_field<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    field: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(var) {
        *field = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value: raw })?;
    }
    Ok(())
}
