//! USB/IP data-phase engine: the reader loop, handshake, and the
//! submit/isochronous/unlink pipelines that sit behind it.

pub mod handshake;
pub mod iso;
pub mod reader;
pub mod submit;
pub mod unlink;

pub use handshake::{HandshakeError, Imported};
pub use reader::ClientEngine;

/// Errors surfaced by the data-phase pipelines (spec.md §7). Distinct
/// from `common::Error`: these are protocol/session-level, not ambient
/// infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),
    #[error("urb error: {0}")]
    Urb(String),
    #[error("connection cancelled")]
    Cancellation,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<protocol::WireError> for EngineError {
    fn from(e: protocol::WireError) -> Self {
        EngineError::ProtocolViolation(e.to_string())
    }
}
