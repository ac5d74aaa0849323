use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::errors::Result;
use crate::metrics::{CHANNEL_FULL_TOTAL, SINK_DROPS_TOTAL};
use crate::model::TelemetryEvent;

/// A downstream consumer of decoded events.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn handle(&self, event: TelemetryEvent) -> Result<()>;
}

enum Lane {
    /// Bounded ring: when full, the oldest queued event is discarded.
    /// The live view favors recency over completeness, and `publish`
    /// never awaits on this lane.
    DropOldest {
        queue: Arc<Mutex<VecDeque<TelemetryEvent>>>,
        notify: Arc<Notify>,
        capacity: usize,
    },
    /// Bounded channel with a brief producer-side wait when full.
    /// Durability takes priority over ingestion latency here, but the
    /// wait is capped so one stuck sink cannot wedge a connection task.
    Block {
        tx: mpsc::Sender<TelemetryEvent>,
        enqueue_wait: Duration,
    },
}

struct SinkHandle {
    name: &'static str,
    lane: Lane,
    dropped: Arc<AtomicU64>,
}

/// Fan-out point between connection handlers and the registered sinks.
///
/// Each sink gets its own bounded queue and worker task, so a slow sink
/// delays nothing but its own queue. Workers are returned as
/// `JoinHandle`s for shutdown draining.
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<SinkHandle>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a most-recent-wins sink (live path).
    pub fn register_drop_oldest<S: Sink>(
        &mut self,
        sink: S,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let notify = Arc::new(Notify::new());
        let name = sink.name();
        self.sinks.push(SinkHandle {
            name,
            lane: Lane::DropOldest {
                queue: queue.clone(),
                notify: notify.clone(),
                capacity,
            },
            dropped: Arc::new(AtomicU64::new(0)),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = notify.notified() => loop {
                        let next = queue.lock().unwrap().pop_front();
                        match next {
                            Some(event) => {
                                if let Err(e) = sink.handle(event).await {
                                    warn!("sink {} failed to handle event: {}", name, e);
                                }
                            }
                            None => break,
                        }
                    },
                }
            }
        })
    }

    /// Register an at-least-once sink with bounded backpressure
    /// (persistence path). The worker drains its queue to completion once
    /// all publishers are gone, which is what graceful shutdown relies on.
    pub fn register_blocking<S: Sink>(
        &mut self,
        sink: S,
        capacity: usize,
        enqueue_wait: Duration,
    ) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel(capacity);
        let name = sink.name();
        self.sinks.push(SinkHandle {
            name,
            lane: Lane::Block { tx, enqueue_wait },
            dropped: Arc::new(AtomicU64::new(0)),
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.handle(event).await {
                    error!("sink {} failed to handle event: {}", name, e);
                }
            }
        })
    }

    /// Deliver one event to every registered sink. A full or failing sink
    /// affects only its own queue, never the other sinks or the caller
    /// beyond the bounded enqueue wait.
    pub async fn publish(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            match &sink.lane {
                Lane::DropOldest {
                    queue,
                    notify,
                    capacity,
                } => {
                    {
                        let mut q = queue.lock().unwrap();
                        if q.len() >= *capacity {
                            q.pop_front();
                            sink.dropped.fetch_add(1, Ordering::Relaxed);
                            SINK_DROPS_TOTAL.with_label_values(&[sink.name]).inc();
                        }
                        q.push_back(event.clone());
                    }
                    notify.notify_one();
                }
                Lane::Block { tx, enqueue_wait } => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(ev)) => {
                        CHANNEL_FULL_TOTAL.inc();
                        match tokio::time::timeout(*enqueue_wait, tx.send(ev)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => {
                                warn!("sink {} queue closed, event discarded", sink.name)
                            }
                            Err(_) => {
                                sink.dropped.fetch_add(1, Ordering::Relaxed);
                                SINK_DROPS_TOTAL.with_label_values(&[sink.name]).inc();
                                error!(
                                    "sink {} enqueue timed out after {:?}, event discarded",
                                    sink.name, enqueue_wait
                                );
                            }
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!("sink {} queue closed, event discarded", sink.name)
                    }
                },
            }
        }
    }

    /// Events dropped so far for the named sink.
    pub fn dropped(&self, name: &str) -> u64 {
        self.sinks
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct CaptureSink {
        name: &'static str,
        events: Arc<Mutex<Vec<TelemetryEvent>>>,
    }

    #[async_trait]
    impl Sink for CaptureSink {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, event: TelemetryEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _event: TelemetryEvent) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "sink offline").into())
        }
    }

    fn make_event(seq: f64) -> TelemetryEvent {
        TelemetryEvent {
            device_id: "dev-1".to_string(),
            timestamp: Utc::now(),
            location: None,
            gas_value: Some(seq),
            detections: Vec::new(),
            image: None,
            source_ip: None,
        }
    }

    // Current-thread runtime: the worker cannot run between publishes,
    // which makes the burst/drop accounting deterministic.
    #[tokio::test]
    async fn test_drop_oldest_burst_keeps_most_recent() {
        let shutdown = CancellationToken::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let _worker = dispatcher.register_drop_oldest(
            CaptureSink {
                name: "capture",
                events: events.clone(),
            },
            10,
            shutdown.clone(),
        );

        for seq in 0..50 {
            dispatcher.publish(make_event(seq as f64)).await;
        }
        assert_eq!(dispatcher.dropped("capture"), 40);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = events.lock().unwrap().clone();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.last().unwrap().gas_value, Some(49.0));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_blocking_lane_delivers_everything() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let worker = dispatcher.register_blocking(
            CaptureSink {
                name: "capture",
                events: events.clone(),
            },
            2,
            Duration::from_secs(1),
        );

        for seq in 0..20 {
            dispatcher.publish(make_event(seq as f64)).await;
        }
        drop(dispatcher);
        worker.await.unwrap();

        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert_eq!(seen[0].gas_value, Some(0.0));
        assert_eq!(seen[19].gas_value, Some(19.0));
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_affect_others() {
        let shutdown = CancellationToken::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let _failing = dispatcher.register_drop_oldest(FailingSink, 4, shutdown.clone());
        let _capture = dispatcher.register_drop_oldest(
            CaptureSink {
                name: "capture",
                events: events.clone(),
            },
            4,
            shutdown.clone(),
        );

        dispatcher.publish(make_event(1.0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(events.lock().unwrap().len(), 1);
        shutdown.cancel();
    }
}
