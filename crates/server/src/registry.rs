//! Device registry: the out-of-scope "driver installation and claiming"
//! collaborator from spec.md §1, given a concrete `rusb`-backed default
//! so the binary runs end to end.

use crate::driver::DriverHandle;
use rusb::UsbContext;
use std::fmt;
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

/// One exportable USB device, as presented to the handshake engine.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// usbfs bus id, e.g. `"1-2"`.
    pub bus_id: String,
    /// Linux sysfs device path, e.g. `"/sys/devices/pci0000:00/.../1-2"`.
    pub path: String,
    pub bus_num: u8,
    pub dev_num: u8,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceRecord>,
}

#[derive(Debug, Clone)]
pub struct InterfaceRecord {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub endpoints: Vec<EndpointRecord>,
}

/// One endpoint of the device's active configuration, as needed to seed
/// `ConfigTree` at attach time without that module depending on `rusb`.
#[derive(Debug, Clone, Copy)]
pub struct EndpointRecord {
    pub address: u8,
    pub transfer_type: EndpointTransferType,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointTransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Device-level VID:PID export filter, e.g. `"1d6b:0002"` or `"*:*"`.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn parse(spec: &str) -> Option<DeviceFilter> {
        let (vid, pid) = spec.split_once(':')?;
        let vendor_id = if vid == "*" {
            None
        } else {
            Some(u16::from_str_radix(vid.trim_start_matches("0x"), 16).ok()?)
        };
        let product_id = if pid == "*" {
            None
        } else {
            Some(u16::from_str_radix(pid.trim_start_matches("0x"), 16).ok()?)
        };
        Some(DeviceFilter {
            vendor_id,
            product_id,
        })
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no such bus id: {0}")]
    NotFound(String),
    #[error("device is filtered from export")]
    Filtered,
    #[error("failed to open device node: {0}")]
    Open(String),
}

/// The interface this entire subsystem exists behind: the engine only
/// ever talks to `dyn DeviceRegistry`.
pub trait DeviceRegistry: Send + Sync {
    /// Every device currently allowed to be exported.
    fn list_shared(&self) -> Vec<DeviceRecord>;

    /// Open `bus_id` for exclusive export, handing back a live driver
    /// handle plus the device record used to answer REP_IMPORT.
    fn try_reserve(&self, bus_id: &str) -> Result<(DeviceRecord, DriverHandle), RegistryError>;

    /// Release a previously-reserved device, e.g. on client disconnect.
    fn mark_detached(&self, bus_id: &str);
}

/// Default `DeviceRegistry` backed by `rusb` enumeration and usbfs.
pub struct RusbDeviceRegistry {
    context: rusb::Context,
    filters: Vec<DeviceFilter>,
}

impl RusbDeviceRegistry {
    pub fn new(filters: Vec<DeviceFilter>) -> Result<RusbDeviceRegistry, rusb::Error> {
        Ok(RusbDeviceRegistry {
            context: rusb::Context::new()?,
            filters,
        })
    }

    fn is_allowed(&self, vendor_id: u16, product_id: u16) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|f| f.matches(vendor_id, product_id))
    }

    fn device_for_bus_id(&self, bus_id: &str) -> Option<rusb::Device<rusb::Context>> {
        self.context.devices().ok()?.iter().find(|d| {
            format!("{}-{}", d.bus_number(), d.address()) == bus_id
        })
    }
}

impl fmt::Debug for RusbDeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusbDeviceRegistry")
            .field("filters", &self.filters)
            .finish()
    }
}

impl DeviceRegistry for RusbDeviceRegistry {
    fn list_shared(&self) -> Vec<DeviceRecord> {
        let Ok(devices) = self.context.devices() else {
            return Vec::new();
        };
        devices
            .iter()
            .filter_map(|device| to_record(&device))
            .filter(|record| self.is_allowed(record.vendor_id, record.product_id))
            .collect()
    }

    fn try_reserve(&self, bus_id: &str) -> Result<(DeviceRecord, DriverHandle), RegistryError> {
        let device = self
            .device_for_bus_id(bus_id)
            .ok_or_else(|| RegistryError::NotFound(bus_id.to_string()))?;
        let record = to_record(&device).ok_or_else(|| RegistryError::NotFound(bus_id.to_string()))?;
        if !self.is_allowed(record.vendor_id, record.product_id) {
            return Err(RegistryError::Filtered);
        }

        let node_path = format!(
            "/dev/bus/usb/{:03}/{:03}",
            record.bus_num, record.dev_num
        );
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&node_path)
            .map_err(|e| RegistryError::Open(e.to_string()))?;
        let fd = file.as_raw_fd();
        std::mem::forget(file); // DriverHandle's worker thread owns the fd now.
        debug!(bus_id, node_path, "reserved device for export");
        Ok((record, DriverHandle::spawn(fd)))
    }

    fn mark_detached(&self, bus_id: &str) {
        debug!(bus_id, "device marked detached");
    }
}

fn to_record(device: &rusb::Device<rusb::Context>) -> Option<DeviceRecord> {
    let descriptor = device.device_descriptor().ok()?;
    let bus_num = device.bus_number();
    let dev_num = device.address();
    let mut interfaces = Vec::new();
    if let Ok(config) = device.active_config_descriptor() {
        for interface in config.interfaces() {
            if let Some(desc) = interface.descriptors().next() {
                let endpoints = desc
                    .endpoint_descriptors()
                    .map(|ep| EndpointRecord {
                        address: ep.address(),
                        transfer_type: match ep.transfer_type() {
                            rusb::TransferType::Control => EndpointTransferType::Control,
                            rusb::TransferType::Isochronous => EndpointTransferType::Isochronous,
                            rusb::TransferType::Bulk => EndpointTransferType::Bulk,
                            rusb::TransferType::Interrupt => EndpointTransferType::Interrupt,
                        },
                        max_packet_size: ep.max_packet_size(),
                        interval: ep.interval(),
                    })
                    .collect();
                interfaces.push(InterfaceRecord {
                    interface_class: desc.class_code(),
                    interface_subclass: desc.sub_class_code(),
                    interface_protocol: desc.protocol_code(),
                    endpoints,
                });
            }
        }
    }
    let configuration_value = device
        .active_config_descriptor()
        .map(|c| c.number())
        .unwrap_or(0);

    Some(DeviceRecord {
        bus_id: format!("{bus_num}-{dev_num}"),
        path: format!("/sys/bus/usb/devices/{bus_num}-{dev_num}"),
        bus_num,
        dev_num,
        speed: speed_code(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device: bcd_from_version(descriptor.device_version()),
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value,
        num_configurations: descriptor.num_configurations(),
        interfaces,
    })
}

/// Map rusb's speed enum onto the USB/IP wire speed codes
/// (`usbip_common.h: usb_device_speed`).
fn speed_code(speed: rusb::Speed) -> u32 {
    match speed {
        rusb::Speed::Low => 1,
        rusb::Speed::Full => 2,
        rusb::Speed::High => 3,
        rusb::Speed::Super => 5,
        rusb::Speed::SuperPlus => 6,
        _ => {
            warn!("unknown device speed, reporting as unknown");
            0
        }
    }
}

/// Pack `rusb::Version`'s major/minor/sub-minor back into the packed-BCD
/// `bcdDevice` field USB/IP carries on the wire.
fn bcd_from_version(version: rusb::Version) -> u16 {
    let (major, minor, sub_minor) = (version.major(), version.minor(), version.sub_minor());
    ((major as u16) << 8) | ((minor as u16) << 4) | sub_minor as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_wildcard() {
        let f = DeviceFilter::parse("*:*").unwrap();
        assert!(f.matches(0x1d6b, 0x0002));
    }

    #[test]
    fn filter_parses_exact_vid_pid() {
        let f = DeviceFilter::parse("1d6b:0002").unwrap();
        assert!(f.matches(0x1d6b, 0x0002));
        assert!(!f.matches(0x1d6b, 0x0003));
    }

    #[test]
    fn filter_rejects_garbage() {
        assert!(DeviceFilter::parse("not-a-filter").is_none());
    }
}
