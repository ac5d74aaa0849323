use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-known GPS fix reported by a sensing node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// One bounding box produced by the on-device detector, with coordinates
/// in pixel space at the 640x480 reference resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionItem {
    pub class_name: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One decoded telemetry message from a sensing node.
///
/// `source_ip` is the socket peer address stamped on by the connection
/// handler, independent of anything the client declares in the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: Option<Location>,
    pub gas_value: Option<f64>,
    pub detections: Vec<DetectionItem>,
    pub image: Option<Vec<u8>>,
    pub source_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
}

/// Live registry entry for one device. Created on the first accepted event,
/// updated on every subsequent one, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub ip_address: Option<IpAddr>,
    pub location: Option<Location>,
    pub last_active: DateTime<Utc>,
    pub status: DeviceStatus,
}

/// Historical `detections` row returned by the query API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DetectionRow {
    pub detection_id: i64,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub num_detections: i32,
    pub gas_value: Option<f64>,
}

/// Historical `detected_items` row returned by the query API.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DetectedItemRow {
    pub item_id: i64,
    pub detection_id: i64,
    pub class_name: String,
    pub confidence: f64,
    pub x_coord: f64,
    pub y_coord: f64,
    pub width: f64,
    pub height: f64,
}

/// REST API response wrapper for detection queries.
#[derive(Debug, Serialize)]
pub struct DetectionResponse {
    pub data: Vec<DetectionRow>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
