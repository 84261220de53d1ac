//! In-memory adapters for unit tests.
//!
//! Both fakes count calls and can be switched into a failing mode so tests
//! can assert how many store queries a read caused, or that cache failures
//! never reach the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::{CacheError, CacheResult, CacheStore};
use crate::models::{Device, HourlyAverage, LocationAverage, Reading};
use crate::store::{ReadingStore, StoreError, StoreResult, StoreSession};

// ---

type ReadingMap = BTreeMap<(String, DateTime<Utc>), f64>;

fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap()
}

#[derive(Default)]
pub struct FakeStore {
    readings: Arc<Mutex<ReadingMap>>,
    devices: Mutex<BTreeMap<String, Device>>,
    unavailable: AtomicBool,
    fail_insert_at: Mutex<Option<usize>>,
    view_queries: AtomicUsize,
    rollbacks: Arc<AtomicUsize>,
}

impl FakeStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Make the session insert at zero-based `index` fail.
    pub fn fail_insert_at(&self, index: Option<usize>) {
        *self.fail_insert_at.lock().unwrap() = index;
    }

    /// Number of view computations (hourly, latest, location, ranged) served.
    pub fn view_queries(&self) -> usize {
        self.view_queries.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.readings
            .lock()
            .unwrap()
            .iter()
            .map(|((device_id, timestamp), value)| Reading {
                device_id: device_id.clone(),
                timestamp: *timestamp,
                value: *value,
            })
            .collect()
    }

    pub fn add_device(&self, device_id: &str, longitude: f64, latitude: f64) {
        self.devices.lock().unwrap().insert(
            device_id.to_string(),
            Device {
                device_id: device_id.to_string(),
                credential_hash: "0".repeat(64),
                longitude,
                latitude,
            },
        );
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("fake store is down".into()));
        }
        Ok(())
    }

    fn view(&self) -> StoreResult<()> {
        self.check()?;
        self.view_queries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for FakeStore {
    async fn upsert_reading(&self, reading: &Reading) -> StoreResult<Reading> {
        self.check()?;
        self.readings.lock().unwrap().insert(
            (reading.device_id.clone(), reading.timestamp),
            reading.value,
        );
        Ok(reading.clone())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>> {
        self.check()?;
        Ok(Box::new(FakeSession {
            readings: Arc::clone(&self.readings),
            rollbacks: Arc::clone(&self.rollbacks),
            fail_at: *self.fail_insert_at.lock().unwrap(),
            pending: Vec::new(),
            open: true,
        }))
    }

    async fn hourly_averages(
        &self,
        since: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> StoreResult<Vec<HourlyAverage>> {
        self.view()?;
        let mut buckets: BTreeMap<DateTime<Utc>, (f64, u32)> = BTreeMap::new();
        for ((dev, ts), value) in self.readings.lock().unwrap().iter() {
            if *ts > since && device_id.map_or(true, |d| d == dev) {
                let slot = buckets.entry(hour_bucket(*ts)).or_insert((0.0, 0));
                slot.0 += value;
                slot.1 += 1;
            }
        }
        Ok(buckets
            .into_iter()
            .map(|(hour, (sum, n))| HourlyAverage {
                hour,
                average: sum / n as f64,
            })
            .collect())
    }

    async fn readings_since(
        &self,
        since: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> StoreResult<Vec<Reading>> {
        self.view()?;
        let mut rows: Vec<Reading> = self
            .rows()
            .into_iter()
            .filter(|r| r.timestamp > since && device_id.map_or(true, |d| d == r.device_id))
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }

    async fn location_averages(&self, since: DateTime<Utc>) -> StoreResult<Vec<LocationAverage>> {
        self.view()?;
        let devices = self.devices.lock().unwrap();
        let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
        for ((dev, ts), value) in self.readings.lock().unwrap().iter() {
            if *ts > since && devices.contains_key(dev) {
                let slot = sums.entry(dev.clone()).or_insert((0.0, 0));
                slot.0 += value;
                slot.1 += 1;
            }
        }
        Ok(sums
            .into_iter()
            .map(|(dev, (sum, n))| {
                let d = &devices[&dev];
                LocationAverage {
                    device_id: dev,
                    longitude: d.longitude,
                    latitude: d.latitude,
                    value: sum / n as f64,
                }
            })
            .collect())
    }

    async fn readings_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Reading>> {
        self.view()?;
        Ok(self
            .rows()
            .into_iter()
            .filter(|r| r.device_id == device_id && r.timestamp >= start && r.timestamp <= end)
            .collect())
    }

    async fn register_device(&self, device: &Device) -> StoreResult<Device> {
        self.check()?;
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&device.device_id) {
            return Err(StoreError::Duplicate(device.device_id.clone()));
        }
        devices.insert(device.device_id.clone(), device.clone());
        Ok(device.clone())
    }

    async fn device(&self, device_id: &str) -> StoreResult<Option<Device>> {
        self.check()?;
        Ok(self.devices.lock().unwrap().get(device_id).cloned())
    }

    async fn devices(&self) -> StoreResult<Vec<Device>> {
        self.check()?;
        Ok(self.devices.lock().unwrap().values().cloned().collect())
    }
}

/// Buffers inserts and applies them to the shared map only on commit.
struct FakeSession {
    readings: Arc<Mutex<ReadingMap>>,
    rollbacks: Arc<AtomicUsize>,
    fail_at: Option<usize>,
    pending: Vec<Reading>,
    open: bool,
}

#[async_trait]
impl StoreSession for FakeSession {
    async fn insert_reading(&mut self, reading: &Reading) -> StoreResult<()> {
        if !self.open {
            return Err(StoreError::SessionClosed);
        }
        if self.fail_at == Some(self.pending.len()) {
            return Err(StoreError::Unavailable("injected insert failure".into()));
        }
        let key = (reading.device_id.clone(), reading.timestamp);
        let exists = self.readings.lock().unwrap().contains_key(&key)
            || self
                .pending
                .iter()
                .any(|p| p.device_id == key.0 && p.timestamp == key.1);
        if exists {
            return Err(StoreError::Duplicate(format!("{}@{}", key.0, key.1)));
        }
        self.pending.push(reading.clone());
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if !self.open {
            return Err(StoreError::SessionClosed);
        }
        self.open = false;
        let mut readings = self.readings.lock().unwrap();
        for r in self.pending.drain(..) {
            readings.insert((r.device_id, r.timestamp), r.value);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if !self.open {
            return Err(StoreError::SessionClosed);
        }
        self.open = false;
        self.pending.clear();
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---

#[derive(Default)]
pub struct FakeCache {
    entries: Mutex<HashMap<String, (String, Duration)>>,
    unavailable: AtomicBool,
    gets: AtomicUsize,
    deletes: Mutex<Vec<String>>,
}

impl FakeCache {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Duration::from_secs(550)));
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Every key a delete was attempted for, in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn check(&self) -> CacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("fake cache is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FakeCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.check()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
