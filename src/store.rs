//! Durable store adapter.
//!
//! [`ReadingStore`] is the only way the aggregation engine and the ingestion
//! path reach the database. Production uses [`PgStore`] over a shared
//! `PgPool`; tests inject an in-memory fake.
//!
//! Every query is parameterized. Window boundaries arrive as a precomputed
//! `since` instant rather than being interpolated into SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::models::{Device, HourlyAverage, LocationAverage, Reading};

// ---

#[derive(Debug, Error)]
pub enum StoreError {
    // ---
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("session already closed")]
    SessionClosed,

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        // ---
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return StoreError::Duplicate(db.message().to_string());
            }
        }
        StoreError::Database(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed access to the readings and devices relations.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    // ---
    /// Insert or overwrite the value stored under `(device_id, timestamp)`.
    async fn upsert_reading(&self, reading: &Reading) -> StoreResult<Reading>;

    /// Open a transactional session owned by the caller.
    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>>;

    /// Mean value per hour bucket for readings strictly after `since`,
    /// ascending by bucket. Empty buckets are absent.
    async fn hourly_averages(
        &self,
        since: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> StoreResult<Vec<HourlyAverage>>;

    /// Readings strictly after `since`, most recent first.
    async fn readings_since(
        &self,
        since: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> StoreResult<Vec<Reading>>;

    /// One row per registered device with readings strictly after `since`.
    async fn location_averages(&self, since: DateTime<Utc>) -> StoreResult<Vec<LocationAverage>>;

    /// Readings of one device with `start <= timestamp <= end`, ascending.
    async fn readings_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Reading>>;

    async fn register_device(&self, device: &Device) -> StoreResult<Device>;

    async fn device(&self, device_id: &str) -> StoreResult<Option<Device>>;

    async fn devices(&self) -> StoreResult<Vec<Device>>;
}

/// A transaction exclusively owned by one call.
///
/// Dropping a session that was neither committed nor rolled back releases it
/// and discards its writes.
#[async_trait]
pub trait StoreSession: Send {
    // ---
    /// Plain insert; a key that already exists is an error.
    async fn insert_reading(&mut self, reading: &Reading) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

// ---

/// PostgreSQL implementation backed by a connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn upsert_reading(&self, reading: &Reading) -> StoreResult<Reading> {
        // ---
        let stored = sqlx::query_as::<_, Reading>(
            r#"
            INSERT INTO sensor_data (device_id, timestamp, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (device_id, timestamp)
            DO UPDATE SET value = EXCLUDED.value
            RETURNING device_id, timestamp, value
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.value)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>> {
        // ---
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx: Some(tx) }))
    }

    async fn hourly_averages(
        &self,
        since: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> StoreResult<Vec<HourlyAverage>> {
        // ---
        let rows = sqlx::query_as::<_, HourlyAverage>(
            r#"
            SELECT
                date_trunc('hour', timestamp, 'UTC') AS hour,
                AVG(value)                           AS average
            FROM sensor_data
            WHERE timestamp > $1
              AND ($2::TEXT IS NULL OR device_id = $2)
            GROUP BY hour
            ORDER BY hour
            "#,
        )
        .bind(since)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn readings_since(
        &self,
        since: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> StoreResult<Vec<Reading>> {
        // ---
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT device_id, timestamp, value
            FROM sensor_data
            WHERE timestamp > $1
              AND ($2::TEXT IS NULL OR device_id = $2)
            ORDER BY timestamp DESC
            "#,
        )
        .bind(since)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn location_averages(&self, since: DateTime<Utc>) -> StoreResult<Vec<LocationAverage>> {
        // ---
        let rows = sqlx::query_as::<_, LocationAverage>(
            r#"
            SELECT d.device_id, d.longitude, d.latitude, AVG(r.value) AS value
            FROM sensor_data r
            JOIN iot_devices d ON r.device_id = d.device_id
            WHERE r.timestamp > $1
            GROUP BY d.device_id, d.longitude, d.latitude
            ORDER BY d.device_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn readings_between(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Reading>> {
        // ---
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT device_id, timestamp, value
            FROM sensor_data
            WHERE device_id = $1
              AND timestamp BETWEEN $2 AND $3
            ORDER BY timestamp
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn register_device(&self, device: &Device) -> StoreResult<Device> {
        // ---
        let stored = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO iot_devices (device_id, credential_hash, longitude, latitude)
            VALUES ($1, $2, $3, $4)
            RETURNING device_id, credential_hash, longitude, latitude
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.credential_hash)
        .bind(device.longitude)
        .bind(device.latitude)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn device(&self, device_id: &str) -> StoreResult<Option<Device>> {
        // ---
        let row = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, credential_hash, longitude, latitude
            FROM iot_devices
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn devices(&self) -> StoreResult<Vec<Device>> {
        // ---
        let rows = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, credential_hash, longitude, latitude
            FROM iot_devices
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Wraps a pooled sqlx transaction. `None` once committed or rolled back.
struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl StoreSession for PgSession {
    async fn insert_reading(&mut self, reading: &Reading) -> StoreResult<()> {
        // ---
        let tx = self.tx.as_mut().ok_or(StoreError::SessionClosed)?;

        sqlx::query(
            r#"
            INSERT INTO sensor_data (device_id, timestamp, value)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.value)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        // ---
        let tx = self.tx.take().ok_or(StoreError::SessionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        // ---
        let tx = self.tx.take().ok_or(StoreError::SessionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}
