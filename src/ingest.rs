//! Ingestion path: single readings and transactional batches.
//!
//! A single reading is upserted and then triggers a detached cache
//! invalidation. The write succeeds once the store has it; a failed or
//! never-run invalidation leaves at most one TTL period of staleness.
//!
//! Batches are all-or-nothing plain inserts. By default they do not
//! invalidate the cache (see `BATCH_INVALIDATE` in [`crate::config`]).

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::aggregate::Aggregator;
use crate::error::SensorError;
use crate::models::{Device, NewDevice, NewReading, Reading};
use crate::store::{ReadingStore, StoreError};

// ---

/// A durably stored reading plus the invalidation it kicked off.
///
/// Dropping `invalidation` detaches the task; it still runs.
#[derive(Debug)]
pub struct Recorded {
    pub reading: Reading,
    pub invalidation: JoinHandle<()>,
}

/// Outcome of a committed batch.
#[derive(Debug)]
pub struct BatchRecorded {
    pub rows: usize,
    /// One task per distinct device, empty unless batch invalidation is on.
    pub invalidations: Vec<JoinHandle<()>>,
}

pub struct Ingestor {
    store: Arc<dyn ReadingStore>,
    aggregator: Arc<Aggregator>,
    invalidate_batches: bool,
}

impl Ingestor {
    // ---
    pub fn new(store: Arc<dyn ReadingStore>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            store,
            aggregator,
            invalidate_batches: false,
        }
    }

    pub fn with_batch_invalidation(mut self, enabled: bool) -> Self {
        self.invalidate_batches = enabled;
        self
    }

    /// Upsert one reading keyed by `(device_id, timestamp)`.
    pub async fn record_reading(&self, new: NewReading) -> Result<Recorded, SensorError> {
        // ---
        let reading = new.validate()?;

        let stored = self.store.upsert_reading(&reading).await.map_err(|e| {
            SensorError::store(
                format!(
                    "storing reading for device '{}' at {}",
                    reading.device_id, reading.timestamp
                ),
                e,
            )
        })?;

        debug!(
            "Stored reading {} = {} for device {}",
            stored.timestamp, stored.value, stored.device_id
        );

        let invalidation = self.spawn_invalidation(stored.device_id.clone());
        Ok(Recorded {
            reading: stored,
            invalidation,
        })
    }

    /// Insert every reading in one transaction, or none of them.
    ///
    /// The whole batch is validated before the session opens. On the first
    /// failed insert the session is rolled back before the error returns.
    pub async fn record_batch(&self, batch: Vec<NewReading>) -> Result<BatchRecorded, SensorError> {
        // ---
        let len = batch.len();
        let readings = batch
            .into_iter()
            .enumerate()
            .map(|(index, new)| {
                new.validate().map_err(|e| match e {
                    SensorError::InvalidInput(msg) => {
                        SensorError::InvalidInput(format!("item {} of {}: {}", index, len, msg))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<Reading>, SensorError>>()?;

        if readings.is_empty() {
            return Ok(BatchRecorded {
                rows: 0,
                invalidations: Vec::new(),
            });
        }

        let mut session = self
            .store
            .begin()
            .await
            .map_err(|e| SensorError::store(format!("opening session for batch of {}", len), e))?;

        for (index, reading) in readings.iter().enumerate() {
            if let Err(cause) = session.insert_reading(reading).await {
                if let Err(e) = session.rollback().await {
                    error!("Rollback of batch of {} failed: {}", len, e);
                }
                error!(
                    "Batch insert failed at item {} (device {}, {}): {}",
                    index, reading.device_id, reading.timestamp, cause
                );
                return Err(SensorError::BatchInsertFailed { index, len, cause });
            }
        }

        session
            .commit()
            .await
            .map_err(|e| SensorError::store(format!("committing batch of {}", len), e))?;

        info!("Committed batch of {} readings", len);

        let invalidations = if self.invalidate_batches {
            let devices: BTreeSet<String> =
                readings.into_iter().map(|r| r.device_id).collect();
            devices
                .into_iter()
                .map(|device_id| self.spawn_invalidation(device_id))
                .collect()
        } else {
            Vec::new()
        };

        Ok(BatchRecorded {
            rows: len,
            invalidations,
        })
    }

    /// Register a device so its readings can join the location view.
    pub async fn register_device(&self, new: NewDevice) -> Result<Device, SensorError> {
        // ---
        let device = new.validate()?;

        match self.store.register_device(&device).await {
            Ok(stored) => {
                info!("Registered device {}", stored.device_id);
                Ok(stored)
            }
            Err(StoreError::Duplicate(_)) => Err(SensorError::Conflict(format!(
                "device '{}'",
                device.device_id
            ))),
            Err(e) => Err(SensorError::store(
                format!("registering device '{}'", device.device_id),
                e,
            )),
        }
    }

    fn spawn_invalidation(&self, device_id: String) -> JoinHandle<()> {
        // ---
        let aggregator = Arc::clone(&self.aggregator);
        tokio::spawn(async move {
            if let Err(e) = aggregator.invalidate(&device_id).await {
                error!("Error invalidating cache for device {}: {}", device_id, e);
            }
        })
    }
}
