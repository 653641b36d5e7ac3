//! Read-only endpoint-to-transfer-type view (spec.md §3).
//!
//! The submit pipeline needs to know an endpoint's transfer type to pick
//! the right driver ioctl and packing strategy, but spec.md §4.2 already
//! recovers that from wire-visible fields for most submits. `ConfigTree`
//! covers the one case that can't: isochronous endpoints look the same as
//! bulk on a non-iso CMD_SUBMIT header when not yet corroborated by a
//! packet count, so the pipeline cross-checks against the device's actual
//! descriptors. Built once at attach time and only invalidated by the
//! trapped `SET_CONFIGURATION`/`SET_INTERFACE` requests that change it.

use crate::registry::{DeviceRecord, EndpointTransferType};
use protocol::classify::TransferKind;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EndpointKey {
    address: u8,
}

#[derive(Debug, Clone, Copy)]
struct EndpointInfo {
    kind: TransferKind,
    interval: u8,
    max_packet_size: u16,
}

pub struct ConfigTree {
    endpoints: RwLock<HashMap<EndpointKey, EndpointInfo>>,
}

impl ConfigTree {
    pub fn empty() -> ConfigTree {
        ConfigTree {
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Build from the device record the registry produced at attach
    /// time (itself derived from `rusb`'s descriptor accessors — kept out
    /// of this module so it stays testable without a live device).
    pub fn from_device_record(record: &DeviceRecord) -> ConfigTree {
        let tree = ConfigTree::empty();
        tree.rebuild(record);
        tree
    }

    /// Replace the endpoint map, called after a trapped SET_CONFIGURATION
    /// or SET_INTERFACE changes what's active.
    pub fn rebuild(&self, record: &DeviceRecord) {
        let mut map = HashMap::new();
        for interface in &record.interfaces {
            for endpoint in &interface.endpoints {
                let kind = match endpoint.transfer_type {
                    EndpointTransferType::Control => TransferKind::Control,
                    EndpointTransferType::Isochronous => TransferKind::Isochronous,
                    EndpointTransferType::Bulk => TransferKind::Bulk,
                    EndpointTransferType::Interrupt => TransferKind::Interrupt,
                };
                map.insert(
                    EndpointKey {
                        address: endpoint.address,
                    },
                    EndpointInfo {
                        kind,
                        interval: endpoint.interval,
                        max_packet_size: endpoint.max_packet_size,
                    },
                );
            }
        }
        *self.endpoints.write().expect("config tree poisoned") = map;
    }

    /// Look up the transfer type for a full endpoint address (direction
    /// bit included), falling back to `fallback` (the wire-classified
    /// guess) if the endpoint isn't in the active configuration — this
    /// can happen transiently around a SET_INTERFACE race.
    pub fn transfer_kind(&self, endpoint_address: u8, fallback: TransferKind) -> TransferKind {
        self.endpoints
            .read()
            .expect("config tree poisoned")
            .get(&EndpointKey {
                address: endpoint_address,
            })
            .map(|info| info.kind)
            .unwrap_or(fallback)
    }

    pub fn max_packet_size(&self, endpoint_address: u8) -> Option<u16> {
        self.endpoints
            .read()
            .expect("config tree poisoned")
            .get(&EndpointKey {
                address: endpoint_address,
            })
            .map(|info| info.max_packet_size)
    }

    pub fn interval(&self, endpoint_address: u8) -> Option<u8> {
        self.endpoints
            .read()
            .expect("config tree poisoned")
            .get(&EndpointKey {
                address: endpoint_address,
            })
            .map(|info| info.interval)
    }
}
