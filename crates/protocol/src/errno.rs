//! Driver-completion-status to Linux errno translation (spec.md §4.8).
//!
//! The kernel usbip client expects `RetSubmitTrailer::status`/
//! `RetUnlinkTrailer::status` to be a negative Linux errno, not the
//! host driver's native completion code. This table is deliberately
//! distinct from any libusb/rusb error mapping: it reflects the kernel
//! usbfs URB status codes returned by `REAPURBNDELAY`.

/// Outcome of a completed (or aborted) URB, as reported by the kernel
/// usbfs reap ioctl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Ok,
    Stall,
    DeviceNotResponding,
    CrcError,
    NoAckFromDevice,
    Underrun,
    Overrun,
    Other,
}

/// Translate a driver completion status to the negative errno placed on
/// the wire in a RET_SUBMIT/RET_UNLINK.
pub fn to_errno(status: DriverStatus) -> i32 {
    match status {
        DriverStatus::Ok => 0,
        DriverStatus::Stall => -libc_errno::EPIPE,
        DriverStatus::DeviceNotResponding => -libc_errno::ETIME,
        DriverStatus::CrcError => -libc_errno::EILSEQ,
        DriverStatus::NoAckFromDevice => -libc_errno::EPROTO,
        DriverStatus::Underrun => -libc_errno::EREMOTEIO,
        DriverStatus::Overrun => -libc_errno::EOVERFLOW,
        DriverStatus::Other => -libc_errno::EPROTO,
    }
}

/// Minimal copy of the Linux errno numbers this table needs, so this
/// crate doesn't have to pull in a libc dependency just for seven
/// constants.
mod libc_errno {
    pub const EPIPE: i32 = 32;
    pub const ETIME: i32 = 62;
    pub const EILSEQ: i32 = 84;
    pub const EPROTO: i32 = 71;
    pub const EREMOTEIO: i32 = 121;
    pub const EOVERFLOW: i32 = 75;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_maps_to_zero() {
        assert_eq!(to_errno(DriverStatus::Ok), 0);
    }

    #[test]
    fn stall_maps_to_epipe() {
        assert_eq!(to_errno(DriverStatus::Stall), -32);
    }

    #[test]
    fn unknown_defaults_to_eproto() {
        assert_eq!(to_errno(DriverStatus::Other), -71);
        assert_eq!(to_errno(DriverStatus::NoAckFromDevice), -71);
    }

    #[test]
    fn underrun_and_overrun_are_distinct() {
        assert_eq!(to_errno(DriverStatus::Underrun), -121);
        assert_eq!(to_errno(DriverStatus::Overrun), -75);
    }
}
