//! Endpoint transfer-type classification.
//!
//! USB/IP submits arrive with no explicit transfer-type field; the server
//! recovers it from the endpoint address, the submit's packet count, and
//! the interval, the same way the kernel client does when it serializes a
//! URB (`drivers/usb/usbip/usbip_common.c: usbip_pack_cmd_submit`). Endpoint
//! 0 is always control.

/// The four USB transfer types, plus control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Recover a submit's transfer type from wire-visible fields alone.
///
/// `ep` is the endpoint number (0-15, direction already stripped).
/// `number_of_packets` is the submit trailer's iso packet count
/// (`0xFFFF_FFFF` or `0` for non-iso). `interval` is the submit trailer's
/// interval field, only meaningful for interrupt endpoints.
pub fn transfer_type(ep: u32, number_of_packets: u32, interval: u32) -> TransferKind {
    if ep == 0 {
        return TransferKind::Control;
    }
    if number_of_packets > 0 && number_of_packets != 0xFFFF_FFFF {
        return TransferKind::Isochronous;
    }
    if interval > 0 {
        TransferKind::Interrupt
    } else {
        TransferKind::Bulk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_zero_is_always_control() {
        assert_eq!(transfer_type(0, 8, 1), TransferKind::Control);
    }

    #[test]
    fn nonzero_packet_count_is_isochronous() {
        assert_eq!(transfer_type(3, 10, 0), TransferKind::Isochronous);
    }

    #[test]
    fn sentinel_packet_count_is_not_isochronous() {
        assert_eq!(transfer_type(3, 0xFFFF_FFFF, 8), TransferKind::Interrupt);
    }

    #[test]
    fn nonzero_interval_without_packets_is_interrupt() {
        assert_eq!(transfer_type(1, 0, 8), TransferKind::Interrupt);
    }

    #[test]
    fn zero_interval_without_packets_is_bulk() {
        assert_eq!(transfer_type(2, 0, 0), TransferKind::Bulk);
    }
}
