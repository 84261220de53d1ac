//! Read-through aggregation engine.
//!
//! Three views are served from the cache when possible and computed from the
//! store otherwise:
//! - windowed hourly averages (`avg_data:{hours}:{scope}`)
//! - latest readings (`latest_data:{hours}:{scope}`)
//! - per-device averages with location (`latest_data_by_location:{hours}:all`)
//!
//! The cache is advisory. A failed cache read is a miss, a failed write-back
//! is logged, and the freshly computed value is returned either way. Only
//! store failures reach the caller.
//!
//! Writes invalidate a fixed superset of keys ([`INVALIDATION_WINDOWS`]);
//! windows outside that set rely on TTL expiry alone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore};
use crate::clock::{Clock, SystemClock};
use crate::error::SensorError;
use crate::models::{
    validate_device_id, Device, DeviceHistory, HourlyAverage, LocationAverage, Reading,
    RESERVED_DEVICE_ID,
};
use crate::store::{ReadingStore, StoreResult};

// ---

/// Window durations whose cache entries are cleared on every write.
///
/// Adding a supported dashboard window means adding it here.
pub const INVALIDATION_WINDOWS: [u32; 4] = [24, 48, 168, 720];

/// The only latest-readings window cleared on write.
pub const LATEST_INVALIDATION_HOURS: u32 = 24;

/// Longest accepted trailing window, ten years.
pub const MAX_WINDOW_HOURS: u32 = 24 * 365 * 10;

/// Just under the 600 s device polling cadence.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(550);

/// Whether a view covers one device or every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Device(String),
}

impl Scope {
    // ---
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Scope::All => None,
            Scope::Device(id) => Some(id.as_str()),
        }
    }
}

impl From<Option<String>> for Scope {
    /// A missing or empty id selects every device.
    fn from(device_id: Option<String>) -> Self {
        device_id
            .filter(|id| !id.is_empty())
            .map_or(Scope::All, Scope::Device)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str(RESERVED_DEVICE_ID),
            Scope::Device(id) => f.write_str(id),
        }
    }
}

/// Cache key in the shared naming scheme other consumers depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey(String);

impl CacheKey {
    // ---
    pub fn average(window_hours: u32, scope: &Scope) -> Self {
        CacheKey(format!("avg_data:{}:{}", window_hours, scope))
    }

    pub fn latest(hours: u32, scope: &Scope) -> Self {
        CacheKey(format!("latest_data:{}:{}", hours, scope))
    }

    pub fn latest_by_location(hours: u32) -> Self {
        CacheKey(format!("latest_data_by_location:{}:all", hours))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every key a write by `device_id` could have made stale.
pub fn invalidation_keys(device_id: &str) -> Vec<CacheKey> {
    // ---
    let device = Scope::Device(device_id.to_string());
    let mut keys = Vec::with_capacity(INVALIDATION_WINDOWS.len() * 3 + 2);

    for window in INVALIDATION_WINDOWS {
        keys.push(CacheKey::average(window, &device));
        keys.push(CacheKey::average(window, &Scope::All));
        keys.push(CacheKey::latest_by_location(window));
    }
    keys.push(CacheKey::latest(LATEST_INVALIDATION_HOURS, &device));
    keys.push(CacheKey::latest(LATEST_INVALIDATION_HOURS, &Scope::All));

    keys
}

fn check_scope(scope: &Scope) -> Result<(), SensorError> {
    match scope.device_id() {
        Some(id) => validate_device_id(id),
        None => Ok(()),
    }
}

// ---

/// Aggregation engine over an injected store and cache.
pub struct Aggregator {
    store: Arc<dyn ReadingStore>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl Aggregator {
    // ---
    pub fn new(store: Arc<dyn ReadingStore>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            cache,
            clock: Arc::new(SystemClock),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Hourly means over the trailing window, ascending by hour.
    pub async fn average(
        &self,
        window_hours: u32,
        scope: &Scope,
    ) -> Result<Vec<HourlyAverage>, SensorError> {
        // ---
        check_scope(scope)?;
        let since = self.window_start(window_hours)?;
        let key = CacheKey::average(window_hours, scope);

        self.read_through(key, || self.store.hourly_averages(since, scope.device_id()))
            .await
    }

    /// Readings inside the trailing window, most recent first.
    pub async fn latest(&self, hours: u32, scope: &Scope) -> Result<Vec<Reading>, SensorError> {
        // ---
        check_scope(scope)?;
        let since = self.window_start(hours)?;
        let key = CacheKey::latest(hours, scope);

        self.read_through(key, || self.store.readings_since(since, scope.device_id()))
            .await
    }

    /// One row per device with its location and mean value over the window.
    pub async fn latest_by_location(
        &self,
        hours: u32,
    ) -> Result<Vec<LocationAverage>, SensorError> {
        // ---
        let since = self.window_start(hours)?;
        let key = CacheKey::latest_by_location(hours);

        self.read_through(key, || self.store.location_averages(since))
            .await
    }

    /// A device and its readings with `start <= timestamp <= end`. Not cached.
    pub async fn device_history(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DeviceHistory, SensorError> {
        // ---
        validate_device_id(device_id)?;
        if start > end {
            return Err(SensorError::InvalidInput(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        let device = self
            .store
            .device(device_id)
            .await
            .map_err(|e| SensorError::store(format!("loading device '{}'", device_id), e))?
            .ok_or_else(|| SensorError::NotFound(format!("device '{}'", device_id)))?;

        let readings = self
            .store
            .readings_between(device_id, start, end)
            .await
            .map_err(|e| {
                SensorError::store(
                    format!("reading history of '{}' from {} to {}", device_id, start, end),
                    e,
                )
            })?;

        Ok(DeviceHistory { device, readings })
    }

    pub async fn devices(&self) -> Result<Vec<Device>, SensorError> {
        self.store
            .devices()
            .await
            .map_err(|e| SensorError::store("listing devices", e))
    }

    /// Delete every cache entry a write for `device_id` could affect.
    ///
    /// All keys are attempted even after a failure; the first failure is
    /// returned. Entries scoped to other devices are left alone.
    pub async fn invalidate(&self, device_id: &str) -> Result<usize, CacheError> {
        // ---
        let mut first_err = None;
        let mut cleared = 0;

        for key in invalidation_keys(device_id) {
            match self.cache.delete(key.as_str()).await {
                Ok(()) => cleared += 1,
                Err(e) => {
                    debug!("Failed to delete {}: {}", key, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!("Invalidated {} cache keys for device {}", cleared, device_id);
                Ok(cleared)
            }
        }
    }

    fn window_start(&self, hours: u32) -> Result<DateTime<Utc>, SensorError> {
        // ---
        if hours == 0 {
            return Err(SensorError::InvalidInput(
                "window must be at least one hour".to_string(),
            ));
        }
        if hours > MAX_WINDOW_HOURS {
            return Err(SensorError::InvalidInput(format!(
                "window of {} hours exceeds the maximum of {}",
                hours, MAX_WINDOW_HOURS
            )));
        }
        self.clock
            .now()
            .checked_sub_signed(chrono::Duration::hours(i64::from(hours)))
            .ok_or_else(|| {
                SensorError::InvalidInput(format!("window of {} hours is too large", hours))
            })
    }

    async fn read_through<T, F, Fut>(&self, key: CacheKey, compute: F) -> Result<T, SensorError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        // ---
        match self.cache.get(key.as_str()).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!("Cache hit for {}", key);
                    return Ok(value);
                }
                Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
            },
            Ok(None) => debug!("Cache miss for {}", key),
            Err(e) => warn!("Cache read for {} failed, using store: {}", key, e),
        }

        let value = compute()
            .await
            .map_err(|e| SensorError::store(format!("computing {}", key), e))?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(key.as_str(), &raw, self.ttl).await {
                    warn!("Cache write-back for {} failed: {}", key, e);
                }
            }
            Err(e) => warn!("Could not serialize {} for caching: {}", key, e),
        }

        Ok(value)
    }
}
