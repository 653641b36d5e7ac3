//! TCP listener / accept loop (spec.md §4.1, §4.11).
//!
//! Shape follows the same accept-loop-plus-per-connection-spawn pattern the
//! teacher used for its iroh transport, but the socket itself is a plain
//! TCP listener and each accepted stream gets its keepalive tuned via
//! `socket2` before being handed to a [`ClientEngine`].

use crate::capture::CaptureSink;
use crate::engine::ClientEngine;
use crate::registry::DeviceRegistry;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Idle time before the first keepalive probe (spec.md §4.1).
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
/// Interval between subsequent probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Probes sent before the connection is considered dead.
const KEEPALIVE_RETRIES: u32 = 5;

/// Bind `bind_addr` and run the accept loop until `shutdown` fires.
///
/// Each accepted connection is tuned (`TCP_NODELAY`, keepalive) and handed
/// off to a freshly constructed [`ClientEngine`] on its own task; the
/// accept loop itself never blocks on a single connection's lifetime.
pub async fn serve(
    bind_addr: SocketAddr,
    registry: Arc<dyn DeviceRegistry>,
    capture: Arc<dyn CaptureSink>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "usbip server listening");
    serve_listener(listener, registry, capture, shutdown).await
}

/// Same accept loop as [`serve`], over an already-bound listener — split
/// out so tests can bind to an ephemeral port and learn the real address
/// before connecting, without duplicating the loop body.
pub async fn serve_listener(
    listener: TcpListener,
    registry: Arc<dyn DeviceRegistry>,
    capture: Arc<dyn CaptureSink>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("accept loop shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                if let Err(e) = tune_stream(&stream) {
                    warn!(peer = %peer_addr, error = %e, "failed to tune socket, continuing anyway");
                }

                info!(peer = %peer_addr, "accepted connection");
                let engine = ClientEngine::new(peer_addr, registry.clone(), capture.clone());
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.run(stream, conn_shutdown).await {
                        warn!(peer = %peer_addr, error = %e, "connection ended with error");
                    }
                });
            }
        }
    }
}

/// Apply `TCP_NODELAY` and the idle/interval/retry keepalive tuning
/// spec.md calls for. Std's `TcpStream` only exposes `set_nodelay`; the
/// finer-grained keepalive knobs need a raw setsockopt, here via `socket2`
/// borrowing the stream's fd rather than taking ownership of it.
fn tune_stream(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    sock_ref.set_tcp_keepalive(&keepalive)?;
    Ok(())
}
