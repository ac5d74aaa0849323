use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;

pub const CLASSES: &[&str] = &["plastic", "metal", "paper", "glass", "organic"];

// Fixes jitter around a fixed site like a slowly drifting node.
const BASE_LAT: f64 = 1.3521;
const BASE_LON: f64 = 103.8198;

#[derive(Debug, Serialize)]
pub struct Prediction {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Wire-format message as the sensing nodes emit it.
#[derive(Debug, Serialize)]
pub struct Telemetry {
    pub device_id: String,
    pub timestamp: String,
    pub num_detections: usize,
    pub gas_value: f64,
    pub lat: f64,
    pub lon: f64,
    pub predictions: Vec<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

pub fn generate_telemetry(rng: &mut impl Rng, device_id: String, frame_prob: f64) -> Telemetry {
    // Roughly one in ten messages is a heartbeat with no detections.
    let num = if rng.gen_bool(0.1) {
        0
    } else {
        rng.gen_range(1..=4)
    };

    let predictions: Vec<Prediction> = (0..num)
        .map(|_| {
            let width = rng.gen_range(0.05..0.4);
            let height = rng.gen_range(0.05..0.4);
            Prediction {
                class_name: CLASSES[rng.gen_range(0..CLASSES.len())].to_string(),
                confidence: rng.gen_range(0.3..0.99),
                x: rng.gen_range(0.0..(1.0 - width)),
                y: rng.gen_range(0.0..(1.0 - height)),
                width,
                height,
            }
        })
        .collect();

    let gas_value = if rng.gen_bool(0.05) {
        rng.gen_range(300.0..900.0) // occasional gas spike
    } else {
        rng.gen_range(50.0..200.0)
    };

    let frame = if !predictions.is_empty() && rng.gen_bool(frame_prob) {
        Some(STANDARD.encode(b"\xff\xd8\xff\xe0simulated-jpeg-frame\xff\xd9"))
    } else {
        None
    };

    Telemetry {
        device_id,
        timestamp: Utc::now().to_rfc3339(),
        num_detections: predictions.len(),
        gas_value,
        lat: BASE_LAT + rng.gen_range(-0.01..0.01),
        lon: BASE_LON + rng.gen_range(-0.01..0.01),
        predictions,
        frame,
    }
}
