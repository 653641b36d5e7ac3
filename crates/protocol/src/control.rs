//! Control-setup constants for trapped requests.
//!
//! A handful of standard control requests are never handed to the device
//! as an opaque URB: the server intercepts them and drives the kernel
//! interface-claim/configuration-select/halt-clear ioctls directly, because
//! the host kernel's usbfs needs to keep its own interface-claim bookkeeping
//! in sync with what the remote client thinks is configured (spec.md §4.7).

/// `bmRequestType` recipient mask.
pub const RECIPIENT_MASK: u8 = 0x1F;
pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;

/// `bmRequestType` direction bit.
pub const DIR_HOST_TO_DEVICE: u8 = 0x00;
pub const DIR_DEVICE_TO_HOST: u8 = 0x80;

/// Standard `bRequest` codes relevant to trapped setups.
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// `wValue` for CLEAR_FEATURE(ENDPOINT_HALT).
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// `wValue` high byte (descriptor type) for GET_DESCRIPTOR(CONFIGURATION).
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;

/// Offset of `bmAttributes` within a standard USB configuration descriptor.
pub const CONFIG_DESCRIPTOR_BM_ATTRIBUTES_OFFSET: usize = 7;

/// `bmAttributes` bit indicating the device supports remote wakeup.
pub const REMOTE_WAKEUP_BIT: u8 = 0x20;

/// An 8-byte control setup packet, decoded from `SubmitTrailer::setup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl ControlSetup {
    pub fn from_bytes(setup: [u8; 8]) -> ControlSetup {
        ControlSetup {
            bm_request_type: setup[0],
            b_request: setup[1],
            w_value: u16::from_le_bytes([setup[2], setup[3]]),
            w_index: u16::from_le_bytes([setup[4], setup[5]]),
            w_length: u16::from_le_bytes([setup[6], setup[7]]),
        }
    }

    pub fn recipient(&self) -> u8 {
        self.bm_request_type & RECIPIENT_MASK
    }

    pub fn direction_in(&self) -> bool {
        self.bm_request_type & DIR_DEVICE_TO_HOST != 0
    }

    /// `true` for an IN GET_DESCRIPTOR(CONFIGURATION) request — the
    /// response's `bmAttributes` REMOTE_WAKEUP bit must be masked off.
    pub fn is_get_configuration_descriptor(&self) -> bool {
        self.direction_in()
            && self.b_request == REQUEST_GET_DESCRIPTOR
            && (self.w_value >> 8) as u8 == DESCRIPTOR_TYPE_CONFIGURATION
    }

    /// Classify this setup as one of the trapped requests the engine
    /// handles directly, if it matches.
    pub fn trapped(&self) -> Option<TrappedRequest> {
        if self.recipient() == RECIPIENT_DEVICE
            && self.b_request == REQUEST_SET_CONFIGURATION
            && !self.direction_in()
        {
            return Some(TrappedRequest::SetConfiguration {
                configuration_value: self.w_value as u8,
            });
        }
        if self.recipient() == RECIPIENT_INTERFACE
            && self.b_request == REQUEST_SET_INTERFACE
            && !self.direction_in()
        {
            return Some(TrappedRequest::SetInterface {
                interface_number: self.w_index as u8,
                alternate_setting: self.w_value as u8,
            });
        }
        if self.recipient() == RECIPIENT_ENDPOINT
            && self.b_request == REQUEST_CLEAR_FEATURE
            && self.w_value == FEATURE_ENDPOINT_HALT
            && !self.direction_in()
        {
            return Some(TrappedRequest::ClearEndpointHalt {
                endpoint_address: self.w_index as u8,
            });
        }
        None
    }
}

/// A control setup that bypasses the ordinary SEND_URB path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrappedRequest {
    SetConfiguration { configuration_value: u8 },
    SetInterface {
        interface_number: u8,
        alternate_setting: u8,
    },
    ClearEndpointHalt { endpoint_address: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(bm: u8, req: u8, value: u16, index: u16) -> [u8; 8] {
        let v = value.to_le_bytes();
        let i = index.to_le_bytes();
        [bm, req, v[0], v[1], i[0], i[1], 0, 0]
    }

    #[test]
    fn set_configuration_is_trapped() {
        let s = ControlSetup::from_bytes(setup(0x00, REQUEST_SET_CONFIGURATION, 1, 0));
        assert_eq!(
            s.trapped(),
            Some(TrappedRequest::SetConfiguration {
                configuration_value: 1
            })
        );
    }

    #[test]
    fn set_interface_requires_to_interface_recipient() {
        let s = ControlSetup::from_bytes(setup(0x01, REQUEST_SET_INTERFACE, 2, 0));
        assert_eq!(
            s.trapped(),
            Some(TrappedRequest::SetInterface {
                interface_number: 0,
                alternate_setting: 2
            })
        );
    }

    #[test]
    fn clear_feature_non_halt_is_not_trapped() {
        let s = ControlSetup::from_bytes(setup(0x02, REQUEST_CLEAR_FEATURE, 1, 0x81));
        assert_eq!(s.trapped(), None);
    }

    #[test]
    fn clear_endpoint_halt_is_trapped() {
        let s = ControlSetup::from_bytes(setup(
            RECIPIENT_ENDPOINT,
            REQUEST_CLEAR_FEATURE,
            FEATURE_ENDPOINT_HALT,
            0x81,
        ));
        assert_eq!(
            s.trapped(),
            Some(TrappedRequest::ClearEndpointHalt {
                endpoint_address: 0x81
            })
        );
    }

    #[test]
    fn get_descriptor_is_not_trapped() {
        let s = ControlSetup::from_bytes(setup(
            DIR_DEVICE_TO_HOST,
            REQUEST_GET_DESCRIPTOR,
            0x0100,
            0,
        ));
        assert_eq!(s.trapped(), None);
    }

    #[test]
    fn get_configuration_descriptor_is_recognized() {
        let s = ControlSetup::from_bytes(setup(
            DIR_DEVICE_TO_HOST,
            REQUEST_GET_DESCRIPTOR,
            0x0200,
            0,
        ));
        assert!(s.is_get_configuration_descriptor());
    }

    #[test]
    fn get_device_descriptor_is_not_a_configuration_descriptor() {
        let s = ControlSetup::from_bytes(setup(
            DIR_DEVICE_TO_HOST,
            REQUEST_GET_DESCRIPTOR,
            0x0100,
            0,
        ));
        assert!(!s.is_get_configuration_descriptor());
    }

    #[test]
    fn out_direction_get_descriptor_is_not_matched() {
        let s = ControlSetup::from_bytes(setup(0x00, REQUEST_GET_DESCRIPTOR, 0x0200, 0));
        assert!(!s.is_get_configuration_descriptor());
    }
}
