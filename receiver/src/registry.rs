use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::dispatch::Sink;
use crate::errors::Result;
use crate::model::{DeviceRecord, DeviceStatus, TelemetryEvent};

/// In-memory store of the last-known state per `device_id`.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// Uses `tokio::sync::RwLock` so snapshot reads never block each other;
/// upserts and the liveness sweep share the same write lock, which is what
/// keeps the status transition race-free.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<String, DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one accepted event into the registry.
    ///
    /// `last_active`, `ip_address`, and status are always refreshed;
    /// `location` only when the event carries one, so a fix survives
    /// later events from a node whose GPS has dropped out.
    ///
    /// The liveness clock runs on receipt: a node draining a backlog of
    /// old-timestamped detections is alive right now, so `last_active`
    /// never moves backwards from a stale payload timestamp.
    pub async fn upsert(&self, event: &TelemetryEvent) -> DeviceRecord {
        let seen = Utc::now().max(event.timestamp);
        let mut map = self.inner.write().await;
        let record = map
            .entry(event.device_id.clone())
            .and_modify(|rec| {
                rec.last_active = rec.last_active.max(seen);
                rec.status = DeviceStatus::Active;
                if event.source_ip.is_some() {
                    rec.ip_address = event.source_ip;
                }
                if event.location.is_some() {
                    rec.location = event.location;
                }
            })
            .or_insert_with(|| DeviceRecord {
                device_id: event.device_id.clone(),
                ip_address: event.source_ip,
                location: event.location,
                last_active: seen,
                status: DeviceStatus::Active,
            });
        record.clone()
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Snapshot of every device ever seen, sorted by id for stable display.
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.inner.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// Flip devices silent for longer than `timeout` to Inactive.
    /// Returns the number of devices flipped. Records are never removed.
    pub async fn sweep_inactive(&self, timeout: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let mut flipped = 0;
        let mut map = self.inner.write().await;
        for record in map.values_mut() {
            if record.status == DeviceStatus::Active && record.last_active < cutoff {
                record.status = DeviceStatus::Inactive;
                flipped += 1;
            }
        }
        flipped
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|r| r.status == DeviceStatus::Active)
            .count()
    }
}

/// Live-path sink: every event becomes a registry upsert.
pub struct RegistrySink {
    registry: DeviceRegistry,
}

impl RegistrySink {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Sink for RegistrySink {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn handle(&self, event: TelemetryEvent) -> Result<()> {
        self.registry.upsert(&event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_event(device_id: &str, location: Option<Location>) -> TelemetryEvent {
        TelemetryEvent {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            location,
            gas_value: None,
            detections: Vec::new(),
            image: None,
            source_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_active_record() {
        let registry = DeviceRegistry::new();
        let record = registry.upsert(&make_event("dev-1", None)).await;

        assert_eq!(record.device_id, "dev-1");
        assert_eq!(record.status, DeviceStatus::Active);
        assert_eq!(
            record.ip_address,
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)))
        );
        assert!(record.location.is_none());
    }

    #[tokio::test]
    async fn test_location_updates_when_present() {
        let registry = DeviceRegistry::new();
        let fix = Location {
            lat: 1.3521,
            lon: 103.8198,
        };
        registry.upsert(&make_event("dev-1", Some(fix))).await;

        let record = registry.get("dev-1").await.unwrap();
        assert_eq!(record.location, Some(fix));
    }

    #[tokio::test]
    async fn test_location_is_sticky_when_absent() {
        let registry = DeviceRegistry::new();
        let fix = Location {
            lat: 1.3521,
            lon: 103.8198,
        };
        registry.upsert(&make_event("dev-1", Some(fix))).await;
        registry.upsert(&make_event("dev-1", None)).await;

        let record = registry.get("dev-1").await.unwrap();
        assert_eq!(record.location, Some(fix));
    }

    #[tokio::test]
    async fn test_sweep_flips_silent_devices_only() {
        let registry = DeviceRegistry::new();
        // Sweep as if six minutes have passed; only "fresh" reported recently.
        let later = Utc::now() + chrono::Duration::minutes(6);
        registry.upsert(&make_event("stale", None)).await;
        registry
            .upsert(&TelemetryEvent {
                timestamp: later,
                ..make_event("fresh", None)
            })
            .await;

        let flipped = registry
            .sweep_inactive(Duration::from_secs(300), later)
            .await;

        assert_eq!(flipped, 1);
        assert_eq!(
            registry.get("stale").await.unwrap().status,
            DeviceStatus::Inactive
        );
        assert_eq!(
            registry.get("fresh").await.unwrap().status,
            DeviceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_inactive_device_reactivates_on_upsert() {
        let registry = DeviceRegistry::new();
        registry.upsert(&make_event("dev-1", None)).await;

        let later = Utc::now() + chrono::Duration::minutes(10);
        let flipped = registry
            .sweep_inactive(Duration::from_secs(300), later)
            .await;
        assert_eq!(flipped, 1);
        assert_eq!(
            registry.get("dev-1").await.unwrap().status,
            DeviceStatus::Inactive
        );

        registry.upsert(&make_event("dev-1", None)).await;
        assert_eq!(
            registry.get("dev-1").await.unwrap().status,
            DeviceStatus::Active
        );
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_backlog_of_late_events_keeps_device_alive() {
        let registry = DeviceRegistry::new();
        // A reconnecting node replays buffered detections stamped well in
        // the past; it must not look silent to the sweep.
        let stale_ts = Utc::now() - chrono::Duration::minutes(10);
        registry
            .upsert(&TelemetryEvent {
                timestamp: stale_ts,
                ..make_event("replayer", None)
            })
            .await;

        let record = registry.get("replayer").await.unwrap();
        assert!(record.last_active > stale_ts + chrono::Duration::minutes(9));

        let flipped = registry
            .sweep_inactive(Duration::from_secs(300), Utc::now())
            .await;
        assert_eq!(flipped, 0);
        assert_eq!(
            registry.get("replayer").await.unwrap().status,
            DeviceStatus::Active
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_and_complete() {
        let registry = DeviceRegistry::new();
        registry.upsert(&make_event("b", None)).await;
        registry.upsert(&make_event("a", None)).await;
        registry.upsert(&make_event("c", None)).await;

        let snapshot = registry.snapshot().await;
        let ids: Vec<&str> = snapshot.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
