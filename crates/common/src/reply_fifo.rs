//! Per-endpoint reply ordering.
//!
//! USB/IP requires replies for a given endpoint to reach the client in the
//! order the corresponding submits were issued, even though the driver
//! adapter completes URBs out of order across endpoints (and, for control
//! transfers racing a reset, sometimes within one). This module gives each
//! raw endpoint its own FIFO of in-flight replies: a worker task per
//! endpoint awaits them strictly in submission order and forwards the
//! encoded bytes into one shared outbound channel, which the connection's
//! single writer task drains onto the socket (spec.md §4.9).
//!
//! Endpoints are registered lazily on first use and never removed — a
//! disconnecting client drops the whole `EndpointReplySerializer`, which
//! aborts every worker task.

use crate::pending::RawEndpoint;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A reply still being produced, boxed so endpoints of different
/// concrete future types can share one FIFO.
pub type ReplyFuture = Pin<Box<dyn Future<Output = Vec<u8>> + Send>>;

struct EndpointWorker {
    enqueue: mpsc::UnboundedSender<ReplyFuture>,
    handle: JoinHandle<()>,
}

/// Fans in-order, per-endpoint reply futures onto one outbound byte stream.
pub struct EndpointReplySerializer {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    workers: Mutex<HashMap<RawEndpoint, EndpointWorker>>,
}

impl EndpointReplySerializer {
    /// `outbound` is the shared channel feeding the connection's writer task.
    pub fn new(outbound: mpsc::UnboundedSender<Vec<u8>>) -> EndpointReplySerializer {
        EndpointReplySerializer {
            outbound,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a reply for `endpoint`, spawning its worker task on first use.
    ///
    /// `reply` resolves to the already-encoded RET_SUBMIT/RET_UNLINK bytes;
    /// it must not itself need to observe ordering relative to other
    /// endpoints, only relative to earlier submits on this one.
    pub fn enqueue(&self, endpoint: RawEndpoint, reply: ReplyFuture) {
        let mut workers = self.workers.lock().expect("reply fifo poisoned");
        let worker = workers.entry(endpoint).or_insert_with(|| {
            let (enqueue, mut rx) = mpsc::unbounded_channel::<ReplyFuture>();
            let outbound = self.outbound.clone();
            let handle = tokio::spawn(async move {
                while let Some(fut) = rx.recv().await {
                    let bytes = fut.await;
                    if outbound.send(bytes).is_err() {
                        break;
                    }
                }
            });
            EndpointWorker { enqueue, handle }
        });
        // The receiving end only closes when the worker task exits, which
        // only happens when `outbound` is closed — at that point the
        // connection is tearing down and a dropped reply is harmless.
        let _ = worker.enqueue.send(reply);
    }

    /// Push already-encoded reply bytes straight to the outbound channel,
    /// bypassing every per-endpoint FIFO. For replies with no ordering
    /// obligation to anything still in flight — e.g. a CMD_UNLINK for a
    /// seqnum that was never pending (spec.md §4.6).
    pub fn send_direct(&self, bytes: Vec<u8>) {
        let _ = self.outbound.send(bytes);
    }

    /// Number of endpoints with an active worker task.
    pub fn endpoint_count(&self) -> usize {
        self.workers.lock().expect("reply fifo poisoned").len()
    }
}

impl Drop for EndpointReplySerializer {
    fn drop(&mut self) {
        for (_, worker) in self.workers.lock().expect("reply fifo poisoned").drain() {
            worker.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn ep(n: u32) -> RawEndpoint {
        RawEndpoint {
            devid: 1,
            direction: 0,
            ep: n,
        }
    }

    #[tokio::test]
    async fn replies_on_one_endpoint_preserve_submission_order() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let serializer = EndpointReplySerializer::new(outbound_tx);

        let (tx_first, rx_first) = oneshot::channel::<()>();
        let (tx_second, rx_second) = oneshot::channel::<()>();

        // First reply is slow (waits on rx_first); second is immediate.
        // Submission order must still win.
        serializer.enqueue(
            ep(1),
            Box::pin(async move {
                rx_first.await.ok();
                vec![1]
            }),
        );
        serializer.enqueue(
            ep(1),
            Box::pin(async move {
                rx_second.await.ok();
                vec![2]
            }),
        );

        // Release the second reply's gate first; it must still not
        // jump ahead of the first in the outbound stream.
        tx_second.send(()).unwrap();
        tokio::task::yield_now().await;
        tx_first.send(()).unwrap();

        assert_eq!(outbound_rx.recv().await, Some(vec![1]));
        assert_eq!(outbound_rx.recv().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn send_direct_bypasses_the_endpoint_fifo() {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let serializer = EndpointReplySerializer::new(outbound_tx);

        serializer.send_direct(vec![9]);
        assert_eq!(outbound_rx.recv().await, Some(vec![9]));
        assert_eq!(serializer.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn distinct_endpoints_get_independent_workers() {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let serializer = Arc::new(EndpointReplySerializer::new(outbound_tx));

        serializer.enqueue(ep(1), Box::pin(async { vec![1] }));
        serializer.enqueue(ep(2), Box::pin(async { vec![2] }));

        tokio::task::yield_now().await;
        assert_eq!(serializer.endpoint_count(), 2);
    }
}
