//! Driver adapter: the boundary between the USB/IP engine and the Linux
//! kernel's usbfs ioctl interface.

pub mod handle;
pub mod ioctl;

pub use handle::{DriverCommand, DriverError, DriverHandle, IsoResult, UrbOutcome};
