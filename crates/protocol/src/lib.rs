//! USB/IP wire protocol
//!
//! This crate is the wire-level vocabulary shared between the server's
//! TCP reader/writer loop and its driver adapter: the binary header/trailer
//! layouts of the USB/IP protocol, the handshake op-header, endpoint
//! transfer-type classification, trapped control-setup recognition, and
//! the driver-status-to-errno translation table. It has no knowledge of
//! sockets, devices, or ioctls — those live in `server`.
//!
//! # Example
//!
//! ```
//! use protocol::wire::{BasicHeader, Command};
//!
//! let header = BasicHeader::for_reply(Command::RetSubmit, 7);
//! let mut buf = Vec::new();
//! header.write_to(&mut buf).unwrap();
//! assert_eq!(buf.len(), protocol::wire::BASIC_HEADER_SIZE);
//! ```

pub mod classify;
pub mod control;
pub mod errno;
pub mod error;
pub mod wire;

pub use classify::{transfer_type, TransferKind};
pub use control::{ControlSetup, TrappedRequest};
pub use errno::{to_errno, DriverStatus};
pub use error::{Result, WireError};
pub use wire::{
    BasicHeader, Command, Direction, IsoPacketDescriptor, OpHeader, Opcode, RetSubmitTrailer,
    RetUnlinkTrailer, SubmitTrailer, UnlinkTrailer, USBIP_VERSION,
};
