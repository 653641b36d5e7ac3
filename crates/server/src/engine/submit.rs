//! CMD_SUBMIT handling: trapped control interception, classification, and
//! dispatch to the driver adapter (spec.md §4.7–§4.9).

use crate::capture::{CapturePoint, CaptureSink};
use crate::config_tree::ConfigTree;
use crate::driver::{DriverHandle, IsoResult, UrbOutcome};
use crate::engine::{iso, EngineError};
use common::pending::{PendingTable, RawEndpoint, RemoveOutcome};
use common::reply_fifo::ReplyFuture;
use protocol::classify::{transfer_type, TransferKind};
use protocol::control::{
    ControlSetup, TrappedRequest, CONFIG_DESCRIPTOR_BM_ATTRIBUTES_OFFSET, REMOTE_WAKEUP_BIT,
};
use protocol::errno::{to_errno, DriverStatus};
use protocol::wire::{
    write_iso_descriptors, BasicHeader, Command, Direction, IsoPacketDescriptor, RetSubmitTrailer,
    SubmitTrailer,
};
use std::sync::Arc;
use tracing::debug;

pub struct SubmitContext {
    pub driver: DriverHandle,
    pub config_tree: Arc<ConfigTree>,
    pub pending: Arc<PendingTable>,
    pub capture: Arc<dyn CaptureSink>,
}

/// Handle one CMD_SUBMIT. Registers the seqnum in the pending table
/// (unless it's a trapped control request) and returns a boxed future
/// that performs the transfer and produces the encoded RET_SUBMIT bytes,
/// meant to be handed to the endpoint's `EndpointReplySerializer` queue.
///
/// Returns `Err` only for malformed input the caller should treat as a
/// protocol violation (e.g. a duplicate seqnum); driver/URB failures are
/// instead folded into the RET_SUBMIT's status field, since the client
/// expects a reply, not a connection close.
pub fn handle(
    header: BasicHeader,
    trailer: SubmitTrailer,
    out_data: Vec<u8>,
    iso_descriptors: Vec<IsoPacketDescriptor>,
    ctx: Arc<SubmitContext>,
) -> Result<ReplyFuture, EngineError> {
    let seqnum = header.seqnum;
    let ep = header.ep;
    let direction_in = Direction::from_wire(header.direction).is_in();
    let endpoint = RawEndpoint {
        devid: header.devid,
        direction: header.direction,
        ep,
    };

    if ep == 0 {
        let setup = ControlSetup::from_bytes(trailer.setup);
        if let Some(trapped) = setup.trapped() {
            // Trapped requests bypass SEND_URB and the pending table
            // entirely: there's nothing for a later UNLINK to race with.
            return Ok(Box::pin(handle_trapped(seqnum, trapped, ctx)));
        }
    }

    if !ctx.pending.insert(seqnum, endpoint) {
        return Err(EngineError::ProtocolViolation(format!(
            "duplicate seqnum {seqnum} in CMD_SUBMIT"
        )));
    }

    let kind = ctx
        .config_tree
        .transfer_kind(ep as u8, transfer_type(ep, trailer.number_of_packets, trailer.interval));

    // A GET_DESCRIPTOR(CONFIGURATION) reply must have its REMOTE_WAKEUP bit
    // masked off (spec.md §4.7 step 3); decide that here, while the setup
    // bytes are still easy to reach, rather than re-deriving it after the
    // round trip through the driver.
    let mask_remote_wakeup = direction_in && ControlSetup::from_bytes(trailer.setup).is_get_configuration_descriptor();

    ctx.capture.write(CapturePoint::InboundPayload, &out_data);

    Ok(Box::pin(async move {
        let outcome = match kind {
            TransferKind::Control => {
                ctx.driver.submit_control(trailer.setup, out_data).await
            }
            TransferKind::Isochronous => {
                iso::submit(&ctx.driver, ep as u8, direction_in, &trailer, out_data, &iso_descriptors)
                    .await
            }
            TransferKind::Bulk | TransferKind::Interrupt => {
                ctx.driver
                    .submit_bulk_or_interrupt(
                        ep as u8,
                        direction_in,
                        trailer.interval as u8,
                        out_data,
                        trailer.transfer_buffer_length,
                    )
                    .await
            }
        };

        // Completion races an UNLINK for this seqnum; whoever removes
        // the entry owns sending a reply. If unlink already won, the
        // URB still ran to completion (or was discarded) but its result
        // is simply dropped here — RET_UNLINK already answered the client.
        match ctx.pending.remove(seqnum) {
            RemoveOutcome::Removed(_) => {
                let bytes = if kind == TransferKind::Isochronous {
                    encode_iso_reply(seqnum, direction_in, outcome, &iso_descriptors, trailer.start_frame)
                } else {
                    encode_reply(seqnum, direction_in, outcome, mask_remote_wakeup)
                };
                ctx.capture.write(CapturePoint::OutboundPayload, &bytes);
                bytes
            }
            RemoveOutcome::AlreadyGone => Vec::new(),
        }
    }))
}

async fn handle_trapped(seqnum: u32, trapped: TrappedRequest, ctx: Arc<SubmitContext>) -> Vec<u8> {
    let result = match trapped {
        TrappedRequest::SetConfiguration { configuration_value } => {
            debug!(configuration_value, "trapped SET_CONFIGURATION");
            ctx.driver.set_configuration(configuration_value).await
        }
        TrappedRequest::SetInterface {
            interface_number,
            alternate_setting,
        } => {
            debug!(interface_number, alternate_setting, "trapped SET_INTERFACE");
            ctx.driver
                .select_interface(interface_number as u32, alternate_setting as u32)
                .await
        }
        TrappedRequest::ClearEndpointHalt { endpoint_address } => {
            debug!(endpoint_address, "trapped CLEAR_FEATURE(ENDPOINT_HALT)");
            ctx.driver.clear_endpoint_halt(endpoint_address).await
        }
    };

    let status = match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(seqnum, error = %e, "trapped control request failed");
            to_errno(DriverStatus::Other)
        }
    };

    let mut buf = Vec::new();
    BasicHeader::for_reply(Command::RetSubmit, seqnum)
        .write_to(&mut buf)
        .expect("write to Vec cannot fail");
    RetSubmitTrailer::non_iso(status, 0)
        .write_to(&mut buf)
        .expect("write to Vec cannot fail");
    buf
}

fn encode_reply(
    seqnum: u32,
    direction_in: bool,
    outcome: Result<UrbOutcome, crate::driver::DriverError>,
    mask_remote_wakeup: bool,
) -> Vec<u8> {
    let mut buf = Vec::new();
    BasicHeader::for_reply(Command::RetSubmit, seqnum)
        .write_to(&mut buf)
        .expect("write to Vec cannot fail");

    match outcome {
        Ok(mut outcome) => {
            let status = to_errno(outcome.status);
            RetSubmitTrailer::non_iso(status, outcome.actual_length)
                .write_to(&mut buf)
                .expect("write to Vec cannot fail");
            if direction_in {
                if mask_remote_wakeup {
                    mask_remote_wakeup_bit(&mut outcome.data);
                }
                buf.extend_from_slice(&outcome.data);
            }
        }
        Err(e) => {
            tracing::warn!(seqnum, error = %e, "driver submit failed");
            RetSubmitTrailer::non_iso(to_errno(DriverStatus::Other), 0)
                .write_to(&mut buf)
                .expect("write to Vec cannot fail");
        }
    }
    buf
}

/// Clear the REMOTE_WAKEUP bit in a GET_DESCRIPTOR(CONFIGURATION) reply's
/// `bmAttributes` byte (spec.md §4.7 step 3), so a remote client can't
/// believe it may wake the proxied device.
fn mask_remote_wakeup_bit(data: &mut [u8]) {
    if let Some(byte) = data.get_mut(CONFIG_DESCRIPTOR_BM_ATTRIBUTES_OFFSET) {
        *byte &= !REMOTE_WAKEUP_BIT;
    }
}

/// Encode a RET_SUBMIT reply for an isochronous transfer (spec.md §4.9 step 4).
/// Unlike the non-ISO case, `number_of_packets` carries the client's original
/// packet count, `start_frame` is echoed back, `error_count` counts packets
/// with non-OK status, and a re-serialized packet-descriptor array follows
/// the data.
fn encode_iso_reply(
    seqnum: u32,
    direction_in: bool,
    outcome: Result<UrbOutcome, crate::driver::DriverError>,
    original_descriptors: &[IsoPacketDescriptor],
    start_frame: u32,
) -> Vec<u8> {
    let mut buf = Vec::new();
    BasicHeader::for_reply(Command::RetSubmit, seqnum)
        .write_to(&mut buf)
        .expect("write to Vec cannot fail");

    match outcome {
        Ok(outcome) => {
            let error_count = outcome
                .iso_results
                .iter()
                .filter(|r| !matches!(r.status, DriverStatus::Ok))
                .count() as u32;
            RetSubmitTrailer {
                status: to_errno(outcome.status),
                actual_length: outcome.actual_length,
                start_frame,
                number_of_packets: original_descriptors.len() as u32,
                error_count,
            }
            .write_to(&mut buf)
            .expect("write to Vec cannot fail");
            if direction_in {
                buf.extend_from_slice(&outcome.data);
            }
            let reply_descriptors = iso_reply_descriptors(original_descriptors, &outcome.iso_results);
            write_iso_descriptors(&mut buf, &reply_descriptors).expect("write to Vec cannot fail");
        }
        Err(e) => {
            tracing::warn!(seqnum, error = %e, "driver submit failed");
            let packet_count = original_descriptors.len() as u32;
            RetSubmitTrailer {
                status: to_errno(DriverStatus::Other),
                actual_length: 0,
                start_frame,
                number_of_packets: packet_count,
                error_count: packet_count,
            }
            .write_to(&mut buf)
            .expect("write to Vec cannot fail");
            let reply_descriptors: Vec<IsoPacketDescriptor> = original_descriptors
                .iter()
                .map(|d| IsoPacketDescriptor {
                    offset: d.offset,
                    length: d.length,
                    actual_length: 0,
                    status: to_errno(DriverStatus::Other),
                })
                .collect();
            write_iso_descriptors(&mut buf, &reply_descriptors).expect("write to Vec cannot fail");
        }
    }
    buf
}

fn iso_reply_descriptors(
    original: &[IsoPacketDescriptor],
    results: &[IsoResult],
) -> Vec<IsoPacketDescriptor> {
    original
        .iter()
        .zip(results.iter())
        .map(|(orig, result)| IsoPacketDescriptor {
            offset: orig.offset,
            length: orig.length,
            actual_length: result.actual_length,
            status: to_errno(result.status),
        })
        .collect()
}
