//! CMD_UNLINK handling (spec.md §4.10).
//!
//! Unlink races the URB it targets to completion: whichever of "the
//! driver adapter's reap loop resolves the URB" or "this handler removes
//! the pending-table entry first" wins sends the reply for that seqnum.
//! If unlink wins, it also tells the driver adapter to discard the URB
//! (best-effort — usbfs may already be mid-completion).

use crate::driver::DriverHandle;
use common::pending::{PendingTable, RawEndpoint, RemoveOutcome};
use common::reply_fifo::ReplyFuture;
use protocol::wire::{BasicHeader, Command, RetUnlinkTrailer};
use std::sync::Arc;

/// Where a CMD_UNLINK's reply should go, decided the instant the pending
/// entry is (or isn't) removed.
pub enum UnlinkOutcome {
    /// The target seqnum was still pending: `endpoint` is its raw endpoint,
    /// so the caller can enqueue `reply` onto that endpoint's FIFO — this
    /// keeps the aborted request's own late RET_SUBMIT, if any, ahead of
    /// the RET_UNLINK (spec.md §4.6, §4.10 step 3).
    Pending {
        endpoint: RawEndpoint,
        reply: ReplyFuture,
    },
    /// The target seqnum was never pending or already resolved; there's
    /// nothing to order against, so the reply goes straight to the
    /// outbound channel.
    AlreadyGone { reply_bytes: Vec<u8> },
}

/// Remove the pending entry for `target_seqnum`, if any, and decide how
/// its CMD_UNLINK reply should be routed. `pending.remove` is synchronous,
/// so this runs immediately on the reader loop — before the caller has to
/// choose a FIFO or the direct outbound channel.
pub fn remove(
    unlink_seqnum: u32,
    target_seqnum: u32,
    pending: Arc<PendingTable>,
    driver: DriverHandle,
) -> UnlinkOutcome {
    match pending.remove(target_seqnum) {
        RemoveOutcome::Removed(endpoint) => UnlinkOutcome::Pending {
            endpoint,
            reply: Box::pin(async move {
                if let Err(e) = driver.abort_endpoint(endpoint.ep as u8).await {
                    tracing::warn!(target_seqnum, error = %e, "abort_endpoint failed during unlink");
                }
                // -ECONNRESET: the canonical "this URB was unlinked" status
                // the kernel client expects, per usbip_common.h.
                encode_reply(unlink_seqnum, -104)
            }),
        },
        RemoveOutcome::AlreadyGone => {
            // The URB already completed (or was never pending); nothing
            // to discard. -ENOENT signals "too late" to the client.
            UnlinkOutcome::AlreadyGone {
                reply_bytes: encode_reply(unlink_seqnum, -2),
            }
        }
    }
}

fn encode_reply(unlink_seqnum: u32, status: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    BasicHeader::for_reply(Command::RetUnlink, unlink_seqnum)
        .write_to(&mut buf)
        .expect("write to Vec cannot fail");
    RetUnlinkTrailer { status }
        .write_to(&mut buf)
        .expect("write to Vec cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(bytes: &[u8]) -> i32 {
        let trailer_start = protocol::wire::BASIC_HEADER_SIZE;
        i32::from_be_bytes([
            bytes[trailer_start],
            bytes[trailer_start + 1],
            bytes[trailer_start + 2],
            bytes[trailer_start + 3],
        ])
    }

    #[test]
    fn unlink_of_unknown_seqnum_returns_enoent_directly() {
        let pending = Arc::new(PendingTable::new());
        let driver = fake_driver();
        match remove(1, 999, pending, driver) {
            UnlinkOutcome::AlreadyGone { reply_bytes } => {
                assert_eq!(status_of(&reply_bytes), -2);
            }
            UnlinkOutcome::Pending { .. } => panic!("expected AlreadyGone"),
        }
    }

    #[tokio::test]
    async fn unlink_of_pending_seqnum_returns_econnreset_on_its_own_endpoint() {
        let pending = Arc::new(PendingTable::new());
        let endpoint = RawEndpoint {
            devid: 1,
            direction: 0,
            ep: 1,
        };
        pending.insert(5, endpoint);
        let driver = fake_driver();
        match remove(1, 5, pending.clone(), driver) {
            UnlinkOutcome::Pending {
                endpoint: returned_endpoint,
                reply,
            } => {
                assert_eq!(returned_endpoint, endpoint);
                assert!(pending.peek(5).is_none());
                let bytes = reply.await;
                assert_eq!(status_of(&bytes), -104);
            }
            UnlinkOutcome::AlreadyGone { .. } => panic!("expected Pending"),
        }
    }

    // A DriverHandle that can't reach a real usbfs fd but exercises the
    // channel plumbing; its worker thread never gets a device open, so
    // calls resolve to WorkerGone once dropped. Good enough here since
    // these tests only assert on the unlink status, which is decided
    // before the abort_endpoint call's result matters.
    fn fake_driver() -> DriverHandle {
        DriverHandle::spawn(-1)
    }
}
