use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::metrics::IMAGE_DECODE_FAILURES_TOTAL;
use crate::model::{DetectionItem, Location, TelemetryEvent};

/// Fixed reference resolution bounding boxes are stored at.
pub const REF_WIDTH: f64 = 640.0;
pub const REF_HEIGHT: f64 = 480.0;

pub const MAX_DEVICE_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("device_id is {0} chars, max is {MAX_DEVICE_ID_LEN}")]
    DeviceIdTooLong(usize),
}

/// Raw wire message as the sensing nodes emit it. Nodes attach extra
/// bookkeeping fields (heartbeat flags, satellite counts, a self-declared
/// sender IP); everything not listed here is ignored.
#[derive(Debug, Deserialize)]
struct WireMessage {
    device_id: Option<String>,
    timestamp: Option<String>,
    gas_value: Option<f64>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    predictions: Vec<WirePrediction>,
    frame: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePrediction {
    #[serde(rename = "class")]
    class_name: Option<String>,
    confidence: Option<f64>,
    x: Option<f64>,
    y: Option<f64>,
    width: Option<f64>,
    height: Option<f64>,
}

#[derive(Debug, Serialize)]
struct WireMessageOut<'a> {
    device_id: &'a str,
    timestamp: String,
    num_detections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    gas_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    predictions: Vec<WirePredictionOut<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<String>,
}

#[derive(Debug, Serialize)]
struct WirePredictionOut<'a> {
    #[serde(rename = "class")]
    class_name: &'a str,
    confidence: f64,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Decodes one complete JSON message into a validated, normalized event.
///
/// `received_at` is used whenever the payload carries no parseable
/// timestamp; a late detection is still worth keeping.
pub fn decode(raw: &[u8], received_at: DateTime<Utc>) -> Result<TelemetryEvent, DecodeError> {
    let wire: WireMessage = serde_json::from_slice(raw)?;

    let device_id = match wire.device_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(DecodeError::MissingField("device_id")),
    };
    if device_id.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(DecodeError::DeviceIdTooLong(device_id.chars().count()));
    }

    let timestamp = wire
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    let location = match (wire.lat, wire.lon) {
        (Some(lat), Some(lon)) => Some(Location { lat, lon }),
        _ => None,
    };

    let detections = wire
        .predictions
        .into_iter()
        .map(|p| DetectionItem {
            class_name: p.class_name.unwrap_or_else(|| "unknown".to_string()),
            confidence: p.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
            x: scale(p.x.unwrap_or(0.0), REF_WIDTH),
            y: scale(p.y.unwrap_or(0.0), REF_HEIGHT),
            width: scale(p.width.unwrap_or(0.0), REF_WIDTH),
            height: scale(p.height.unwrap_or(0.0), REF_HEIGHT),
        })
        .collect();

    // A broken frame never blocks detection-data ingestion.
    let image = wire.frame.as_deref().and_then(|frame| {
        match STANDARD.decode(frame) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                IMAGE_DECODE_FAILURES_TOTAL.inc();
                warn!(device_id = %device_id, "dropping undecodable frame: {}", e);
                None
            }
        }
    });

    Ok(TelemetryEvent {
        device_id,
        timestamp,
        location,
        gas_value: wire.gas_value,
        detections,
        image,
        source_ip: None,
    })
}

/// Re-emits an event as one wire JSON line. Coordinates are written in
/// pixel space, which the `> 1.0` rule in [`decode`] passes through
/// unscaled, so a dead-lettered event replays to an identical event.
pub fn encode(event: &TelemetryEvent) -> serde_json::Result<String> {
    let out = WireMessageOut {
        device_id: &event.device_id,
        timestamp: event.timestamp.to_rfc3339(),
        num_detections: event.detections.len(),
        gas_value: event.gas_value,
        lat: event.location.map(|l| l.lat),
        lon: event.location.map(|l| l.lon),
        predictions: event
            .detections
            .iter()
            .map(|d| WirePredictionOut {
                class_name: &d.class_name,
                confidence: d.confidence,
                x: d.x,
                y: d.y,
                width: d.width,
                height: d.height,
            })
            .collect(),
        frame: event.image.as_deref().map(|bytes| STANDARD.encode(bytes)),
    };
    serde_json::to_string(&out)
}

/// Nodes normally send box coordinates normalized to [0, 1]; some senders
/// report pixel space directly, so anything above 1.0 passes through.
fn scale(value: f64, axis: f64) -> f64 {
    if value > 1.0 {
        value
    } else {
        value * axis
    }
}

/// Nodes send `datetime.now().isoformat()` which has no zone suffix, but
/// tolerate full RFC 3339 as well.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_decode_full_message() {
        let raw = br#"{"device_id":"RaspberryPi5","timestamp":"2025-03-20T15:30:45.123456","num_detections":1,"gas_value":120.5,"lat":1.3521,"lon":103.8198,"predictions":[{"class":"plastic","confidence":0.85,"x":0.4,"y":0.6,"width":0.2,"height":0.15}]}"#;
        let event = decode(raw, now()).unwrap();

        assert_eq!(event.device_id, "RaspberryPi5");
        assert_eq!(event.gas_value, Some(120.5));
        assert_eq!(
            event.location,
            Some(Location {
                lat: 1.3521,
                lon: 103.8198
            })
        );
        assert_eq!(event.detections.len(), 1);

        let item = &event.detections[0];
        assert_eq!(item.class_name, "plastic");
        assert_eq!(item.confidence, 0.85);
        assert_eq!(item.x, 256.0);
        assert_eq!(item.y, 288.0);
        assert_eq!(item.width, 128.0);
        assert_eq!(item.height, 72.0);
        assert!(event.image.is_none());
    }

    #[test]
    fn test_missing_device_id() {
        assert!(matches!(
            decode(br#"{"predictions":[]}"#, now()),
            Err(DecodeError::MissingField("device_id"))
        ));
        assert!(matches!(
            decode(br#"{"device_id":""}"#, now()),
            Err(DecodeError::MissingField("device_id"))
        ));
    }

    #[test]
    fn test_device_id_too_long() {
        let raw = format!(r#"{{"device_id":"{}"}}"#, "x".repeat(65));
        assert!(matches!(
            decode(raw.as_bytes(), now()),
            Err(DecodeError::DeviceIdTooLong(65))
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            decode(b"not json at all", now()),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_minimal_message_defaults() {
        let received = now();
        let event = decode(br#"{"device_id":"A"}"#, received).unwrap();

        assert_eq!(event.device_id, "A");
        assert_eq!(event.timestamp, received);
        assert!(event.location.is_none());
        assert!(event.gas_value.is_none());
        assert!(event.detections.is_empty());
        assert!(event.image.is_none());
    }

    #[test]
    fn test_bad_timestamp_falls_back_to_receipt_time() {
        let received = now();
        let raw = br#"{"device_id":"A","timestamp":"yesterday-ish"}"#;
        let event = decode(raw, received).unwrap();
        assert_eq!(event.timestamp, received);
    }

    #[test]
    fn test_naive_iso_timestamp_parses() {
        let raw = br#"{"device_id":"A","timestamp":"2025-03-20T15:30:45.123456"}"#;
        let event = decode(raw, now()).unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2025-03-20T15:30:45.123456+00:00");
    }

    #[test]
    fn test_pixel_space_coordinates_pass_through() {
        let raw = br#"{"device_id":"A","predictions":[{"class":"metal","confidence":0.5,"x":320.0,"y":240.0,"width":64.0,"height":48.0}]}"#;
        let event = decode(raw, now()).unwrap();
        let item = &event.detections[0];
        assert_eq!(item.x, 320.0);
        assert_eq!(item.y, 240.0);
        assert_eq!(item.width, 64.0);
        assert_eq!(item.height, 48.0);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let raw = br#"{"device_id":"A","predictions":[{"class":"glass","confidence":1.7,"x":0.1,"y":0.1,"width":0.1,"height":0.1},{"class":"paper","confidence":-0.2,"x":0.1,"y":0.1,"width":0.1,"height":0.1}]}"#;
        let event = decode(raw, now()).unwrap();
        assert_eq!(event.detections[0].confidence, 1.0);
        assert_eq!(event.detections[1].confidence, 0.0);
    }

    #[test]
    fn test_missing_class_becomes_unknown() {
        let raw = br#"{"device_id":"A","predictions":[{"confidence":0.4}]}"#;
        let event = decode(raw, now()).unwrap();
        assert_eq!(event.detections[0].class_name, "unknown");
        assert_eq!(event.detections[0].x, 0.0);
    }

    #[test]
    fn test_valid_frame_decodes() {
        let frame = STANDARD.encode(b"\xff\xd8fakejpeg");
        let raw = format!(r#"{{"device_id":"A","frame":"{}"}}"#, frame);
        let event = decode(raw.as_bytes(), now()).unwrap();
        assert_eq!(event.image.as_deref(), Some(&b"\xff\xd8fakejpeg"[..]));
    }

    #[test]
    fn test_broken_frame_is_omitted_not_fatal() {
        let raw = br#"{"device_id":"A","gas_value":5.0,"frame":"%%%not-base64%%%"}"#;
        let event = decode(raw, now()).unwrap();
        assert!(event.image.is_none());
        assert_eq!(event.gas_value, Some(5.0));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let raw = br#"{"device_id":"A","timestamp":"2025-03-20T15:30:45.123456","gas_value":7.5,"lat":1.3521,"lon":103.8198,"predictions":[{"class":"plastic","confidence":0.85,"x":0.4,"y":0.6,"width":0.2,"height":0.15}],"frame":"/9g="}"#;
        let event = decode(raw, now()).unwrap();

        let line = encode(&event).unwrap();
        let replayed = decode(line.as_bytes(), now()).unwrap();
        assert_eq!(replayed, event);
    }
}
