use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use receiver::config::Config;
use receiver::dispatch::Dispatcher;
use receiver::persist::PersistenceSink;
use receiver::registry::{DeviceRegistry, RegistrySink};
use receiver::server::ListenerSettings;
use receiver::{db, liveness, metrics, rest, server};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting waste telemetry receiver");
    info!("Mode: {:?}", config.mode);
    info!("Telemetry listener: {}", config.listen_addr);
    info!("HTTP server: {}", config.http_addr);

    // Initialize metrics
    metrics::init_metrics();

    let shutdown = CancellationToken::new();
    let registry = DeviceRegistry::new();
    let mut dispatcher = Dispatcher::new();
    let mut sink_workers = Vec::new();

    if config.mode.wants_registry() {
        let worker = dispatcher.register_drop_oldest(
            RegistrySink::new(registry.clone()),
            config.live_queue_capacity,
            shutdown.clone(),
        );
        sink_workers.push(("registry", worker));
    }

    let pool = if config.mode.wants_persistence() {
        info!(
            "Database: {}",
            config.database_url.split('@').last().unwrap_or("***")
        );
        match db::make_pool(&config.database_url).await {
            Ok(pool) => {
                let sink = PersistenceSink::new(
                    pool.clone(),
                    config.max_write_retries,
                    &config.dead_letter_path,
                );
                let worker = dispatcher.register_blocking(
                    sink,
                    config.persist_queue_capacity,
                    Duration::from_millis(config.persist_enqueue_wait_ms),
                );
                sink_workers.push(("persistence", worker));
                Some(pool)
            }
            Err(e) => {
                error!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let dispatcher = Arc::new(dispatcher);

    // Liveness monitor
    let monitor_handle = tokio::spawn(liveness::run_monitor(
        registry.clone(),
        Duration::from_secs(config.liveness_timeout_secs),
        Duration::from_secs(config.liveness_sweep_secs),
        shutdown.clone(),
    ));

    // Telemetry listener
    let telemetry_listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    let settings = ListenerSettings {
        max_connections: config.max_connections,
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
    };
    let mut listener_handle = tokio::spawn(server::run_listener(
        telemetry_listener,
        dispatcher.clone(),
        settings,
        shutdown.clone(),
    ));

    // HTTP server with metrics endpoint and the query API
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(pool, registry.clone()));
    let http_listener = match TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };
    info!("HTTP server listening on {}", config.http_addr);
    let server_handle = tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    let mut listener_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = &mut listener_handle => {
            error!("Telemetry listener terminated unexpectedly");
            listener_done = true;
        }
    }

    info!("Shutting down");
    shutdown.cancel();
    if !listener_done {
        let _ = listener_handle.await;
    }
    let _ = monitor_handle.await;
    server_handle.abort();

    // Dropping the dispatcher closes the sink queues; the persistence
    // worker then drains what it has already accepted.
    drop(dispatcher);
    let drain = Duration::from_secs(config.drain_timeout_secs);
    for (name, mut worker) in sink_workers {
        match tokio::time::timeout(drain, &mut worker).await {
            Ok(_) => info!("{} sink drained", name),
            Err(_) => {
                error!("{} sink did not drain within {:?}, aborting it", name, drain);
                worker.abort();
            }
        }
    }

    info!("Shutdown complete");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
