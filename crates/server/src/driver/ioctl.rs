//! Linux usbfs ioctl surface.
//!
//! `#[repr(C)]` structures and `nix` ioctl wrappers matching
//! `linux/usbdevice_fs.h`. These are the raw shapes the kernel expects on
//! `/dev/bus/usb/BBB/DDD`; everything above this module talks in terms of
//! `DriverHandle`, never these structs directly.

#![allow(non_camel_case_types)]

use bitflags::bitflags;
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_int, ioctl_write_ptr};
use std::os::unix::io::RawFd;

bitflags! {
    /// `URB_*` flags from `usbdevice_fs.h`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UrbFlags: u32 {
        const SHORT_NOT_OK = 0x0001;
        const ISO_ASAP = 0x0002;
        const ZERO_PACKET = 0x0040;
    }
}

/// `usbdevice_fs.h: enum usbdevfs_urb_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UrbType {
    Isochronous = 0,
    Interrupt = 1,
    Control = 2,
    Bulk = 3,
}

/// `usbdevice_fs.h: struct usbdevfs_iso_packet_desc`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IsoPacketDesc {
    pub length: u32,
    pub actual_length: u32,
    pub status: u32,
}

/// `usbdevice_fs.h: struct usbdevfs_urb`.
///
/// The `buffer` pointer is written once by [`DriverHandle`] from a pinned
/// `Box<[u8]>` and never moved until the kernel has returned the URB via
/// `REAPURBNDELAY`.
#[repr(C)]
pub struct Urb {
    pub urb_type: u8,
    pub endpoint: u8,
    pub status: i32,
    pub flags: u32,
    pub buffer: *mut u8,
    pub buffer_length: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets_or_stream_id: i32,
    pub error_count: i32,
    pub signr: u32,
    pub usercontext: *mut std::ffi::c_void,
    pub iso_frame_desc: [IsoPacketDesc; 0],
}

impl Urb {
    pub fn new(urb_type: UrbType, endpoint: u8, flags: UrbFlags) -> Urb {
        Urb {
            urb_type: urb_type as u8,
            endpoint,
            status: 0,
            flags: flags.bits(),
            buffer: std::ptr::null_mut(),
            buffer_length: 0,
            actual_length: 0,
            start_frame: 0,
            number_of_packets_or_stream_id: 0,
            error_count: 0,
            signr: 0,
            usercontext: std::ptr::null_mut(),
            iso_frame_desc: [],
        }
    }
}

/// `usbdevice_fs.h: struct usbdevfs_setinterface`.
#[repr(C)]
pub struct SetInterface {
    pub interface: u32,
    pub altsetting: u32,
}

/// `usbdevice_fs.h: struct usbdevfs_ctrltransfer`.
#[repr(C)]
pub struct CtrlTransfer {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
    pub timeout: u32,
    pub data: *mut u8,
}

const USBDEVFS_IOC_MAGIC: u8 = b'U';

ioctl_readwrite!(control, USBDEVFS_IOC_MAGIC, 0, CtrlTransfer);
ioctl_write_ptr!(setinterface, USBDEVFS_IOC_MAGIC, 4, SetInterface);
ioctl_write_int!(setconfiguration, USBDEVFS_IOC_MAGIC, 5);
ioctl_write_ptr!(submiturb, USBDEVFS_IOC_MAGIC, 10, Urb);
ioctl_write_ptr!(discardurb, USBDEVFS_IOC_MAGIC, 11, Urb);
ioctl_read!(reapurb, USBDEVFS_IOC_MAGIC, 12, *mut Urb);
ioctl_read!(reapurbndelay, USBDEVFS_IOC_MAGIC, 13, *mut Urb);
ioctl_write_int!(claiminterface, USBDEVFS_IOC_MAGIC, 15);
ioctl_write_int!(releaseinterface, USBDEVFS_IOC_MAGIC, 16);
ioctl_write_int!(clear_halt, USBDEVFS_IOC_MAGIC, 21);
ioctl_write_int!(reset, USBDEVFS_IOC_MAGIC, 20);

/// Thin safe-ish wrappers; callers still must uphold the `Urb` buffer
/// pointer lifetime invariant described on [`Urb`].
pub mod ops {
    use super::*;

    pub unsafe fn submit(fd: RawFd, urb: *mut Urb) -> nix::Result<i32> {
        unsafe { submiturb(fd, urb) }
    }

    pub unsafe fn discard(fd: RawFd, urb: *mut Urb) -> nix::Result<i32> {
        unsafe { discardurb(fd, urb) }
    }

    pub unsafe fn reap_nonblocking(fd: RawFd, out: *mut *mut Urb) -> nix::Result<i32> {
        unsafe { reapurbndelay(fd, out) }
    }

    pub fn claim_interface(fd: RawFd, interface: u8) -> nix::Result<i32> {
        unsafe { claiminterface(fd, interface as i32) }
    }

    pub fn release_interface(fd: RawFd, interface: u8) -> nix::Result<i32> {
        unsafe { releaseinterface(fd, interface as i32) }
    }

    pub fn set_configuration(fd: RawFd, configuration_value: u8) -> nix::Result<i32> {
        unsafe { setconfiguration(fd, configuration_value as i32) }
    }

    pub fn select_interface(fd: RawFd, interface: u32, altsetting: u32) -> nix::Result<i32> {
        let mut req = SetInterface {
            interface,
            altsetting,
        };
        unsafe { setinterface(fd, &mut req) }
    }

    pub fn clear_endpoint_halt(fd: RawFd, endpoint: u8) -> nix::Result<i32> {
        unsafe { clear_halt(fd, endpoint as i32) }
    }

    pub fn reset_device(fd: RawFd) -> nix::Result<i32> {
        unsafe { reset(fd, 0) }
    }
}
