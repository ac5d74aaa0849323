use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::errors::Result;
use crate::model::TelemetryEvent;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(crate::errors::Error::Migration)?;
    info!("Migrations completed");

    Ok(pool)
}

/// Commit one event in a single transaction: device upsert, detection
/// insert, item inserts, keyframe insert iff an image is present.
/// All-or-nothing; a partial write is never observable.
///
/// Returns the new `detection_id`.
pub async fn write_event(pool: &PgPool, event: &TelemetryEvent) -> Result<i64> {
    let mut tx = pool.begin().await?;

    // COALESCE keeps the last non-null location when a later event has
    // no GPS fix, matching the registry's sticky-location rule. The
    // liveness clock runs on receipt, like the registry's, so a replayed
    // backlog of old-stamped events never moves `last_active` backwards.
    sqlx::query(
        r#"
        INSERT INTO devices (device_id, ip_address, location_lat, location_lon, last_active)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (device_id) DO UPDATE SET
            ip_address   = COALESCE(EXCLUDED.ip_address, devices.ip_address),
            location_lat = COALESCE(EXCLUDED.location_lat, devices.location_lat),
            location_lon = COALESCE(EXCLUDED.location_lon, devices.location_lon),
            last_active  = GREATEST(EXCLUDED.last_active, devices.last_active)
        "#,
    )
    .bind(&event.device_id)
    .bind(event.source_ip.map(|ip| ip.to_string()))
    .bind(event.location.map(|l| l.lat))
    .bind(event.location.map(|l| l.lon))
    .bind(Utc::now().max(event.timestamp))
    .execute(&mut *tx)
    .await?;

    let detection_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO detections (device_id, timestamp, num_detections, gas_value)
        VALUES ($1, $2, $3, $4)
        RETURNING detection_id
        "#,
    )
    .bind(&event.device_id)
    .bind(event.timestamp)
    .bind(event.detections.len() as i32)
    .bind(event.gas_value)
    .fetch_one(&mut *tx)
    .await?;

    for item in &event.detections {
        sqlx::query(
            r#"
            INSERT INTO detected_items
                (detection_id, class_name, confidence, x_coord, y_coord, width, height)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(detection_id)
        .bind(&item.class_name)
        .bind(item.confidence)
        .bind(item.x)
        .bind(item.y)
        .bind(item.width)
        .bind(item.height)
        .execute(&mut *tx)
        .await?;
    }

    if let Some(image) = &event.image {
        sqlx::query(
            r#"
            INSERT INTO keyframes (detection_id, image_data, image_format)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(detection_id)
        .bind(image.as_slice())
        .bind("jpg")
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(detection_id)
}

/// Connection-class failures are worth retrying; constraint violations
/// and other data errors are not.
pub fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}
