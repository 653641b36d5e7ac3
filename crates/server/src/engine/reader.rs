//! The per-connection reader/writer loop (spec.md §4.11).
//!
//! Structurally the same shape as the teacher's `ClientConnection::run`:
//! accept, handshake, then a `tokio::select!` loop that reads fixed-size
//! headers off the socket and dispatches, while a companion writer task
//! drains one shared outbound channel fed by the per-endpoint reply
//! serializer. Here the transport is a plain `TcpStream` instead of a
//! QUIC bi-stream.

use crate::capture::{CapturePoint, CaptureSink};
use crate::config_tree::ConfigTree;
use crate::engine::{handshake, submit, unlink, EngineError};
use crate::registry::DeviceRegistry;
use common::pending::PendingTable;
use common::reply_fifo::EndpointReplySerializer;
use protocol::wire::{BasicHeader, Command, SubmitTrailer, UnlinkTrailer, BASIC_HEADER_SIZE, TRAILER_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives one client connection end to end: handshake, then the
/// CMD_SUBMIT/CMD_UNLINK data phase until the peer disconnects or
/// `shutdown` fires.
pub struct ClientEngine {
    peer_addr: SocketAddr,
    registry: Arc<dyn DeviceRegistry>,
    capture: Arc<dyn CaptureSink>,
}

impl ClientEngine {
    pub fn new(
        peer_addr: SocketAddr,
        registry: Arc<dyn DeviceRegistry>,
        capture: Arc<dyn CaptureSink>,
    ) -> ClientEngine {
        ClientEngine {
            peer_addr,
            registry,
            capture,
        }
    }

    pub async fn run(self, stream: TcpStream, shutdown: CancellationToken) -> Result<(), EngineError> {
        let mut stream = stream;
        let imported = match handshake::run(&mut stream, self.registry.as_ref()).await {
            Ok(imported) => imported,
            Err(handshake::HandshakeError::DevlistOnly) => return Ok(()),
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "handshake failed");
                return Ok(());
            }
        };
        info!(peer = %self.peer_addr, bus_id = %imported.record.bus_id, "handshake complete");

        let (read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let serializer = Arc::new(EndpointReplySerializer::new(outbound_tx));
        let pending = Arc::new(PendingTable::new());
        let config_tree = Arc::new(ConfigTree::from_device_record(&imported.record));
        let submit_ctx = Arc::new(submit::SubmitContext {
            driver: imported.driver.clone(),
            config_tree,
            pending: pending.clone(),
            capture: self.capture.clone(),
        });

        let writer_shutdown = shutdown.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        outbound_rx.close();
                        while let Some(bytes) = outbound_rx.recv().await {
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                    maybe_bytes = outbound_rx.recv() => {
                        match maybe_bytes {
                            Some(bytes) => {
                                if write_half.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let result = self
            .read_loop(read_half, submit_ctx, serializer, imported.driver, shutdown.clone())
            .await;

        shutdown.cancel();
        let _ = writer.await;
        result
    }

    async fn read_loop(
        &self,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        submit_ctx: Arc<submit::SubmitContext>,
        serializer: Arc<EndpointReplySerializer>,
        driver: crate::driver::DriverHandle,
        shutdown: CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            let mut header_buf = [0u8; BASIC_HEADER_SIZE];
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("reader loop cancelled");
                    return Ok(());
                }
                read_result = read_half.read_exact(&mut header_buf) => {
                    match read_result {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            debug!(peer = %self.peer_addr, "peer closed connection");
                            return Ok(());
                        }
                        Err(e) => return Err(EngineError::Io(e)),
                    }
                }
            }

            self.capture.write(CapturePoint::InboundHeader, &header_buf);
            let header = BasicHeader::read_from(&mut &header_buf[..])?;

            match header.command()? {
                Command::CmdSubmit => {
                    let mut trailer_buf = [0u8; TRAILER_SIZE];
                    read_half.read_exact(&mut trailer_buf).await?;
                    let trailer = SubmitTrailer::read_from(&mut &trailer_buf[..])?;

                    let direction_in =
                        protocol::wire::Direction::from_wire(header.direction).is_in();
                    let out_data_len = if direction_in {
                        0
                    } else {
                        trailer.transfer_buffer_length as usize
                    };
                    let mut out_data = vec![0u8; out_data_len];
                    if out_data_len > 0 {
                        read_half.read_exact(&mut out_data).await?;
                    }

                    let iso_descriptors = if trailer.is_isochronous() {
                        let mut desc_buf =
                            vec![0u8; trailer.number_of_packets as usize * protocol::wire::ISO_DESC_SIZE];
                        read_half.read_exact(&mut desc_buf).await?;
                        protocol::wire::read_iso_descriptors(
                            &mut std::io::Cursor::new(desc_buf),
                            trailer.number_of_packets,
                        )?
                    } else {
                        Vec::new()
                    };

                    let endpoint = common::pending::RawEndpoint {
                        devid: header.devid,
                        direction: header.direction,
                        ep: header.ep,
                    };
                    match submit::handle(header, trailer, out_data, iso_descriptors, submit_ctx.clone())
                    {
                        Ok(reply_future) => serializer.enqueue(endpoint, reply_future),
                        Err(e) => {
                            warn!(peer = %self.peer_addr, error = %e, "rejecting malformed submit");
                            return Err(e);
                        }
                    }
                }
                Command::CmdUnlink => {
                    let mut trailer_buf = [0u8; TRAILER_SIZE];
                    read_half.read_exact(&mut trailer_buf).await?;
                    let unlink_trailer = UnlinkTrailer::read_from(&mut &trailer_buf[..])?;
                    let target_seqnum = unlink_trailer.seqnum;
                    let unlink_seqnum = header.seqnum;
                    let pending = submit_ctx.pending.clone();
                    let driver = driver.clone();

                    // `unlink::remove` removes the pending entry synchronously, so
                    // the correct routing — the aborted request's own endpoint, or
                    // straight to the outbound channel — is known before enqueueing.
                    match unlink::remove(unlink_seqnum, target_seqnum, pending, driver) {
                        unlink::UnlinkOutcome::Pending { endpoint, reply } => {
                            serializer.enqueue(endpoint, reply);
                        }
                        unlink::UnlinkOutcome::AlreadyGone { reply_bytes } => {
                            serializer.send_direct(reply_bytes);
                        }
                    }
                }
                other => {
                    return Err(EngineError::ProtocolViolation(format!(
                        "unexpected command on data phase: {other:?}"
                    )));
                }
            }
        }
    }
}

