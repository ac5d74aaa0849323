use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::error;

use crate::model::{DetectedItemRow, DetectionResponse, DetectionRow, DeviceRecord};
use crate::registry::DeviceRegistry;

#[derive(Clone)]
struct AppState {
    /// Absent in live-only mode; store-backed endpoints answer 503 then.
    pool: Option<PgPool>,
    registry: DeviceRegistry,
}

#[derive(Debug, Deserialize)]
pub struct DetectionQuery {
    device_id: Option<String>,
    class: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub fn create_router(pool: Option<PgPool>, registry: DeviceRegistry) -> Router {
    let state = AppState { pool, registry };

    Router::new()
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/detections", get(get_detections))
        .route("/api/v1/detections/:id/items", get(get_detection_items))
        .route("/api/v1/detections/:id/keyframe", get(get_keyframe))
        .with_state(state)
}

/// Live registry snapshot for the dashboard. Read-only; the dashboard
/// never mutates device state.
async fn get_devices(State(state): State<AppState>) -> Json<Vec<DeviceRecord>> {
    Json(state.registry.snapshot().await)
}

async fn get_detections(
    State(state): State<AppState>,
    Query(params): Query<DetectionQuery>,
) -> Result<Json<DetectionResponse>, AppError> {
    let pool = store(&state)?;
    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);

    // Build WHERE clause with positional binds
    let mut conditions = Vec::new();
    let mut idx = 0;
    if params.device_id.is_some() {
        idx += 1;
        conditions.push(format!("device_id = ${idx}"));
    }
    if params.class.is_some() {
        idx += 1;
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM detected_items di \
             WHERE di.detection_id = detections.detection_id AND di.class_name = ${idx})"
        ));
    }
    if params.start.is_some() {
        idx += 1;
        conditions.push(format!("timestamp >= ${idx}"));
    }
    if params.end.is_some() {
        idx += 1;
        conditions.push(format!("timestamp <= ${idx}"));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let query = format!(
        "SELECT detection_id, device_id, timestamp, num_detections, gas_value
         FROM detections
         {}
         ORDER BY timestamp DESC
         LIMIT {} OFFSET {}",
        where_clause, limit, offset
    );

    let mut query_builder = sqlx::query_as::<_, DetectionRow>(&query);
    if let Some(device_id) = &params.device_id {
        query_builder = query_builder.bind(device_id);
    }
    if let Some(class) = &params.class {
        query_builder = query_builder.bind(class);
    }
    if let Some(start) = &params.start {
        query_builder = query_builder.bind(start);
    }
    if let Some(end) = &params.end {
        query_builder = query_builder.bind(end);
    }

    let detections = query_builder.fetch_all(pool).await.map_err(|e| {
        error!("Database error: {}", e);
        AppError::Internal(anyhow::anyhow!("Database query failed: {}", e))
    })?;

    Ok(Json(DetectionResponse {
        total: detections.len(),
        data: detections,
        limit,
        offset,
    }))
}

async fn get_detection_items(
    State(state): State<AppState>,
    Path(detection_id): Path<i64>,
) -> Result<Json<Vec<DetectedItemRow>>, AppError> {
    let pool = store(&state)?;
    let items = sqlx::query_as::<_, DetectedItemRow>(
        "SELECT item_id, detection_id, class_name, confidence, x_coord, y_coord, width, height
         FROM detected_items
         WHERE detection_id = $1
         ORDER BY item_id",
    )
    .bind(detection_id)
    .fetch_all(pool)
    .await?;

    Ok(Json(items))
}

async fn get_keyframe(
    State(state): State<AppState>,
    Path(detection_id): Path<i64>,
) -> Result<Response, AppError> {
    let pool = store(&state)?;
    let row = sqlx::query_as::<_, (Vec<u8>, String)>(
        "SELECT image_data, image_format FROM keyframes WHERE detection_id = $1",
    )
    .bind(detection_id)
    .fetch_optional(pool)
    .await?;

    let (image_data, image_format) = row.ok_or(AppError::NotFound)?;
    let content_type = match image_format.as_str() {
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        other => format!("image/{other}"),
    };

    Ok(([(header::CONTENT_TYPE, content_type)], image_data).into_response())
}

fn store(state: &AppState) -> Result<&PgPool, AppError> {
    state.pool.as_ref().ok_or(AppError::Unavailable)
}

enum AppError {
    Unavailable,
    NotFound,
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "historical store not enabled in this mode".to_string(),
            )
                .into_response(),
            AppError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()).into_response(),
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", e),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
