//! Route providers: distance/duration between two coordinates.
//!
//! - **`StraightLineRouteProvider`**: haversine × route inflation at a time-of-day speed. Always available.
//! - **`OsrmRouteProvider`** (feature `osrm`): an OSRM HTTP endpoint.
//! - **`CachedRouteProvider`**: LRU wrapper around any provider.
//!
//! Callers fall back to the straight-line provider whenever the configured provider
//! fails or times out (see [`FareEstimator`](crate::pricing::FareEstimator)).

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use h3o::Resolution;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::RoutingError;
use crate::model::GeoPoint;
use crate::spatial::{cell_at, haversine_km};
use crate::traffic::SpeedProfile;

/// Road distance is longer than the great-circle distance by about this factor.
pub const ROUTE_INFLATION: f64 = 1.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Provider,
    StraightLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_min: f64,
    pub source: RouteSource,
}

/// Which routing backend to use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteProviderKind {
    /// No external router; straight-line estimates only.
    #[default]
    StraightLine,
    /// OSRM HTTP endpoint (e.g. `"http://localhost:5000"`).
    #[cfg(feature = "osrm")]
    Osrm { endpoint: String },
}

#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn distance_and_duration(
        &self,
        from: GeoPoint,
        to: GeoPoint,
    ) -> Result<RouteEstimate, RoutingError>;
}

// ---------------------------------------------------------------------------
// Straight-line provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StraightLineRouteProvider {
    speed: SpeedProfile,
    utc_offset_minutes: i32,
    clock: Arc<dyn Clock>,
}

impl StraightLineRouteProvider {
    pub fn new(speed: SpeedProfile, utc_offset_minutes: i32, clock: Arc<dyn Clock>) -> Self {
        Self {
            speed,
            utc_offset_minutes,
            clock,
        }
    }

    /// Infallible estimate used as the fallback of every other provider.
    pub fn estimate(&self, from: GeoPoint, to: GeoPoint) -> RouteEstimate {
        let distance_km = haversine_km(from, to) * ROUTE_INFLATION;
        let kmh = self
            .speed
            .speed_at(self.clock.now_ms(), self.utc_offset_minutes);
        RouteEstimate {
            distance_km,
            duration_min: distance_km / kmh * 60.0,
            source: RouteSource::StraightLine,
        }
    }
}

#[async_trait]
impl RouteProvider for StraightLineRouteProvider {
    async fn distance_and_duration(
        &self,
        from: GeoPoint,
        to: GeoPoint,
    ) -> Result<RouteEstimate, RoutingError> {
        Ok(self.estimate(from, to))
    }
}

// ---------------------------------------------------------------------------
// OSRM provider (behind `osrm` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "osrm")]
pub mod osrm {
    use super::*;
    use std::time::Duration;

    pub struct OsrmRouteProvider {
        client: reqwest::Client,
        endpoint: String,
    }

    impl OsrmRouteProvider {
        pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RoutingError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| RoutingError::Unavailable(e.to_string()))?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
            })
        }
    }

    #[derive(Deserialize)]
    struct OsrmResponse {
        code: String,
        routes: Option<Vec<OsrmRoute>>,
    }

    #[derive(Deserialize)]
    struct OsrmRoute {
        distance: f64, // metres
        duration: f64, // seconds
    }

    #[async_trait]
    impl RouteProvider for OsrmRouteProvider {
        async fn distance_and_duration(
            &self,
            from: GeoPoint,
            to: GeoPoint,
        ) -> Result<RouteEstimate, RoutingError> {
            let url = format!(
                "{}/route/v1/driving/{},{};{},{}?overview=false",
                self.endpoint, from.lon, from.lat, to.lon, to.lat,
            );
            let resp: OsrmResponse = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| RoutingError::Unavailable(e.to_string()))?
                .json()
                .await
                .map_err(|e| RoutingError::Unavailable(e.to_string()))?;

            if resp.code != "Ok" {
                return Err(RoutingError::NoRoute);
            }
            let route = resp
                .routes
                .and_then(|routes| routes.into_iter().next())
                .ok_or(RoutingError::NoRoute)?;

            Ok(RouteEstimate {
                distance_km: route.distance / 1000.0,
                duration_min: route.duration / 60.0,
                source: RouteSource::Provider,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Caching wrapper
// ---------------------------------------------------------------------------

/// Resolution used to quantise cache keys (~25 m cells).
const CACHE_KEY_RESOLUTION: Resolution = Resolution::Eleven;

/// LRU-cached wrapper around any [`RouteProvider`]. Only successes are cached.
pub struct CachedRouteProvider {
    inner: Arc<dyn RouteProvider>,
    cache: Mutex<LruCache<(u64, u64), RouteEstimate>>,
}

impl CachedRouteProvider {
    pub fn new(inner: Arc<dyn RouteProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(from: GeoPoint, to: GeoPoint) -> Option<(u64, u64)> {
        let from = cell_at(from, CACHE_KEY_RESOLUTION).ok()?;
        let to = cell_at(to, CACHE_KEY_RESOLUTION).ok()?;
        Some((u64::from(from), u64::from(to)))
    }
}

#[async_trait]
impl RouteProvider for CachedRouteProvider {
    async fn distance_and_duration(
        &self,
        from: GeoPoint,
        to: GeoPoint,
    ) -> Result<RouteEstimate, RoutingError> {
        let key = Self::key(from, to);
        if let Some(key) = key {
            if let Some(hit) = self.cache.lock().get(&key) {
                return Ok(*hit);
            }
        }

        let estimate = self.inner.distance_and_duration(from, to).await?;
        if let Some(key) = key {
            self.cache.lock().put(key, estimate);
        }
        Ok(estimate)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

#[cfg(feature = "osrm")]
const DEFAULT_ROUTE_CACHE_CAPACITY: usize = 20_000;

/// Build the external provider for `kind`. `None` means straight-line only.
pub fn build_route_provider(
    kind: &RouteProviderKind,
    #[allow(unused_variables)] timeout: std::time::Duration,
) -> Result<Option<Arc<dyn RouteProvider>>, RoutingError> {
    match kind {
        RouteProviderKind::StraightLine => Ok(None),

        #[cfg(feature = "osrm")]
        RouteProviderKind::Osrm { endpoint } => {
            let inner = Arc::new(osrm::OsrmRouteProvider::new(endpoint, timeout)?);
            Ok(Some(Arc::new(CachedRouteProvider::new(
                inner,
                DEFAULT_ROUTE_CACHE_CAPACITY,
            ))))
        }
    }
}
