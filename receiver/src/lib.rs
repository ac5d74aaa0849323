//! Telemetry receiver for field-deployed waste-detection nodes: accepts
//! newline-delimited JSON over TCP, keeps a live device registry, and
//! persists detections to Postgres.

pub mod codec;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod liveness;
pub mod metrics;
pub mod model;
pub mod persist;
pub mod registry;
pub mod rest;
pub mod server;
