//! Data models for the sensor aggregation service.
//!
//! `Reading` and `Device` mirror the persisted relations. The view row types
//! (`HourlyAverage`, `LocationAverage`) are derived projections that only ever
//! live in responses and in the cache.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SensorError;

// ---

static DEVICE_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("device id pattern is valid")
});

/// Scope name for the all-devices cache keys; no device may take it.
pub const RESERVED_DEVICE_ID: &str = "all";

/// Check an externally assigned device identifier against the accepted pattern.
pub fn validate_device_id(device_id: &str) -> Result<(), SensorError> {
    // ---
    if device_id == RESERVED_DEVICE_ID {
        return Err(SensorError::InvalidInput(format!(
            "device id '{}' is reserved",
            device_id
        )));
    }
    if DEVICE_ID_PATTERN.is_match(device_id) {
        Ok(())
    } else {
        Err(SensorError::InvalidInput(format!(
            "malformed device id '{}'",
            device_id
        )))
    }
}

/// A stored reading, unique per `(device_id, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Reading as submitted by a device or a bulk upload, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReading {
    // ---
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl NewReading {
    // ---
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            value,
        }
    }

    /// Validate and convert into a storable `Reading`. No I/O happens here.
    pub fn validate(self) -> Result<Reading, SensorError> {
        // ---
        validate_device_id(&self.device_id)?;
        if !self.value.is_finite() {
            return Err(SensorError::InvalidInput(format!(
                "non-finite value {} for device '{}' at {}",
                self.value, self.device_id, self.timestamp
            )));
        }

        Ok(Reading {
            device_id: self.device_id,
            timestamp: self.timestamp,
            value: self.value,
        })
    }
}

/// A registered device. The credential hash never leaves the service.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Device {
    // ---
    pub device_id: String,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// Registration request for a new device.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    // ---
    pub device_id: String,
    pub secret_key: String,
    pub longitude: f64,
    pub latitude: f64,
}

impl NewDevice {
    // ---
    pub fn validate(self) -> Result<Device, SensorError> {
        // ---
        validate_device_id(&self.device_id)?;
        if self.secret_key.is_empty() {
            return Err(SensorError::InvalidInput(format!(
                "empty secret key for device '{}'",
                self.device_id
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) || !(-90.0..=90.0).contains(&self.latitude)
        {
            return Err(SensorError::InvalidInput(format!(
                "coordinates ({}, {}) out of range for device '{}'",
                self.longitude, self.latitude, self.device_id
            )));
        }

        Ok(Device {
            credential_hash: hash_secret(&self.device_id, &self.secret_key),
            device_id: self.device_id,
            longitude: self.longitude,
            latitude: self.latitude,
        })
    }
}

/// SHA-256 over `device_id:secret`, hex encoded.
fn hash_secret(device_id: &str, secret: &str) -> String {
    // ---
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// A device together with a slice of its raw readings.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHistory {
    // ---
    pub device: Device,
    pub readings: Vec<Reading>,
}

/// Mean value of one hour bucket in a windowed average view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HourlyAverage {
    // ---
    pub hour: DateTime<Utc>,
    pub average: f64,
}

/// Per-device mean over a window, joined with the device location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocationAverage {
    // ---
    pub device_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub value: f64,
}
