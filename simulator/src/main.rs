mod telemetry;

use std::env;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let target_addr = env::var("TARGET_ADDR").unwrap_or_else(|_| "127.0.0.1:5002".to_string());
    let rate: u64 = env::var("RATE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);
    let num_devices: usize = env::var("DEVICES")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .unwrap_or(10);
    let frame_prob: f64 = env::var("FRAME_PROB")
        .unwrap_or_else(|_| "0.05".to_string())
        .parse()
        .unwrap_or(0.05);
    let frame_prob = frame_prob.clamp(0.0, 1.0);

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting sensing-node simulator");
    info!(
        "Target: {}, Rate: {} msg/s, Devices: {}",
        target_addr, rate, num_devices
    );

    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    const BURST_SIZE: usize = 50;
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate.max(1));
    info!(
        "Sending in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    let mut conn = connect_with_retry(&target_addr).await;

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = format!("node-{}", counter % num_devices as u64);
            let message = telemetry::generate_telemetry(&mut rng, device_id, frame_prob);

            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };
            line.push('\n');

            if let Err(e) = conn.write_all(line.as_bytes()).await {
                warn!("Write failed ({}), reconnecting", e);
                conn = connect_with_retry(&target_addr).await;
                continue;
            }
            counter += 1;
        }

        // Log progress periodically
        if counter % 1000 == 0 {
            info!("Sent {} messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - receiver may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

async fn connect_with_retry(addr: &str) -> TcpStream {
    let mut backoff = Duration::from_millis(500);
    loop {
        match TcpStream::connect(addr).await {
            Ok(conn) => {
                info!("Connected to {}", addr);
                return conn;
            }
            Err(e) => {
                warn!(
                    "Failed to connect to {}: {}. Retrying in {:?}...",
                    addr, e, backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(10));
            }
        }
    }
}
