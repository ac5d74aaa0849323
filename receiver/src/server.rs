use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec;
use crate::dispatch::Dispatcher;
use crate::errors::{Error, Result};
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, DECODE_FAILURES_TOTAL, IDLE_TIMEOUTS_TOTAL,
    MESSAGES_TOTAL, VALID_MESSAGES_TOTAL,
};

/// Frames carry base64 JPEGs, so the cap is generous.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

/// Accept loop. One task per connection, capped; beyond the cap the client
/// gets an explicit one-line rejection instead of a silent close.
pub async fn run_listener(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    settings: ListenerSettings,
    shutdown: CancellationToken,
) {
    let active = Arc::new(AtomicUsize::new(0));
    info!("Telemetry listener accepting connections");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        if active.load(Ordering::Relaxed) >= settings.max_connections {
            CONNECTIONS_REJECTED_TOTAL.inc();
            warn!(
                "Rejecting connection from {}: cap of {} reached",
                peer, settings.max_connections
            );
            tokio::spawn(reject(stream));
            continue;
        }

        active.fetch_add(1, Ordering::Relaxed);
        CONNECTIONS_ACTIVE.inc();
        info!("Connection from {}", peer);

        let dispatcher = dispatcher.clone();
        let active = active.clone();
        let shutdown = shutdown.clone();
        let idle_timeout = settings.idle_timeout;
        tokio::spawn(async move {
            match handle_connection(stream, peer, dispatcher, idle_timeout, shutdown).await {
                Ok(()) => info!("Connection closed from {}", peer),
                Err(Error::IdleTimeout(bound)) => {
                    IDLE_TIMEOUTS_TOTAL.inc();
                    info!("Closing connection from {}: idle for {:?}", peer, bound);
                }
                Err(e) => warn!("Connection from {} failed: {}", peer, e),
            }
            active.fetch_sub(1, Ordering::Relaxed);
            CONNECTIONS_ACTIVE.dec();
        });
    }

    info!("Telemetry listener stopped");
}

async fn reject(mut stream: TcpStream) {
    let _ = stream
        .write_all(b"{\"error\":\"too many connections\"}\n")
        .await;
}

/// Per-connection read loop: newline-delimited framing, idle timeout, peer
/// address stamped onto every decoded event. A malformed message is logged
/// and skipped; it never terminates the connection.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = timeout(idle_timeout, read_frame(&mut reader, &mut buf)) => read,
        };
        let n = match read {
            Err(_elapsed) => return Err(Error::IdleTimeout(idle_timeout)),
            Ok(result) => result?,
        };
        if n == 0 {
            return Ok(()); // EOF
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        MESSAGES_TOTAL.inc();
        match codec::decode(&buf, Utc::now()) {
            Ok(mut event) => {
                event.source_ip = Some(peer.ip());
                VALID_MESSAGES_TOTAL.inc();
                dispatcher.publish(event).await;
            }
            Err(e) => {
                DECODE_FAILURES_TOTAL.inc();
                warn!("Skipping malformed message from {}: {}", peer, e);
            }
        }
    }
}

/// Read one newline-delimited frame, bounded by `MAX_FRAME_BYTES`. A frame
/// that hits the bound without a delimiter has lost framing, so the
/// connection is closed rather than resynchronized.
async fn read_frame(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> Result<usize> {
    let mut limited = (&mut *reader).take(MAX_FRAME_BYTES as u64);
    let n = limited.read_until(b'\n', buf).await?;
    if n == MAX_FRAME_BYTES && !buf.ends_with(b"\n") {
        return Err(Error::FrameTooLarge {
            got: n,
            limit: MAX_FRAME_BYTES,
        });
    }
    Ok(n)
}
