//! Database schema management for `sensorflow-aggregates`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `iot_devices` registry and the `sensor_data` readings table.
/// Readings are unique per `(device_id, timestamp)`, which is what the
/// single-reading upsert conflicts on. Safe to call on every startup.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS iot_devices (
            device_id       TEXT             PRIMARY KEY,
            credential_hash TEXT             NOT NULL,
            longitude       DOUBLE PRECISION NOT NULL,
            latitude        DOUBLE PRECISION NOT NULL,
            created_at      TIMESTAMPTZ      NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Orphan readings are rejected at the ingestion boundary, not by a foreign key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_data (
            id        BIGSERIAL        PRIMARY KEY,
            device_id TEXT             NOT NULL,
            timestamp TIMESTAMPTZ      NOT NULL,
            value     DOUBLE PRECISION NOT NULL,
            CONSTRAINT sensor_data_device_timestamp_key UNIQUE (device_id, timestamp)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Window scans across all devices
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_data_timestamp
            ON sensor_data (timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
