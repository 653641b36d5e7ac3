//! Handshake phase: REQ_DEVLIST/REQ_IMPORT.
//!
//! Runs before any CMD_SUBMIT traffic is possible; the reader loop hands
//! off to `run` immediately after accept and doesn't start the data-phase
//! loop until `run` returns an imported device (or the connection closes
//! on REQ_DEVLIST / a failed import).

use crate::registry::{DeviceRecord, DeviceRegistry, RegistryError};
use protocol::wire::{OpHeader, Opcode, USBIP_VERSION};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// Outcome of a successful handshake: the client requested import and it
/// succeeded, handing the reader loop the device to run the data phase
/// against.
pub struct Imported {
    pub record: DeviceRecord,
    pub driver: crate::driver::DriverHandle,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("wire error: {0}")]
    Wire(#[from] protocol::WireError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed during handshake after devlist (no import requested)")]
    DevlistOnly,
}

/// Drive the handshake phase to completion on an already-accepted stream.
///
/// Loops on REQ_DEVLIST answers (a client may query the list more than
/// once before importing) until it sees REQ_IMPORT, which either
/// succeeds (returning `Imported`) or fails (replying REP_IMPORT with a
/// nonzero status and returning an error — the caller should close the
/// connection per spec.md §4.4).
pub async fn run<S>(
    stream: &mut S,
    registry: &dyn DeviceRegistry,
) -> Result<Imported, HandshakeError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let mut header_buf = [0u8; protocol::wire::OP_HEADER_SIZE];
        stream.read_exact(&mut header_buf).await?;
        let header = OpHeader::read_from(&mut &header_buf[..])?;

        match header.opcode()? {
            Opcode::ReqDevlist => {
                reply_devlist(stream, registry).await?;
            }
            Opcode::ReqImport => {
                let mut bus_id_buf = [0u8; 32];
                stream.read_exact(&mut bus_id_buf).await?;
                let bus_id = bus_id_from_bytes(&bus_id_buf);
                return reply_import(stream, registry, &bus_id).await;
            }
            other => {
                warn!(?other, "unexpected opcode during handshake");
                return Err(HandshakeError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected handshake opcode",
                )));
            }
        }
    }
}

fn bus_id_from_bytes(buf: &[u8; 32]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

async fn reply_devlist<S>(
    stream: &mut S,
    registry: &dyn DeviceRegistry,
) -> Result<(), HandshakeError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let devices = registry.list_shared();
    let mut buf = Vec::new();
    OpHeader::reply(Opcode::RepDevlist, 0).write_to(&mut buf)?;
    buf.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for device in &devices {
        write_device_record(&mut buf, device)?;
        buf.extend_from_slice(&(device.interfaces.len() as u32).to_be_bytes());
        for interface in &device.interfaces {
            buf.push(interface.interface_class);
            buf.push(interface.interface_subclass);
            buf.push(interface.interface_protocol);
            buf.push(0); // padding byte, per usbip_common.h usb_interface
        }
    }
    stream.write_all(&buf).await?;
    info!(count = devices.len(), "replied to REQ_DEVLIST");
    Ok(())
}

async fn reply_import<S>(
    stream: &mut S,
    registry: &dyn DeviceRegistry,
    bus_id: &str,
) -> Result<Imported, HandshakeError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    match registry.try_reserve(bus_id) {
        Ok((record, driver)) => {
            // Decided Open Question (see DESIGN.md): SET_CONFIG 0 is
            // issued before the success reply so the remote client's
            // view of "imported" always starts from a known configuration
            // state.
            if let Err(e) = driver.set_configuration(0).await {
                warn!(bus_id, error = %e, "initial SET_CONFIGURATION(0) failed");
            }

            let mut buf = Vec::new();
            OpHeader::reply(Opcode::RepImport, 0).write_to(&mut buf)?;
            write_device_record(&mut buf, &record)?;
            stream.write_all(&buf).await?;
            info!(bus_id, "imported device");
            Ok(Imported { record, driver })
        }
        Err(e) => {
            let status = match e {
                RegistryError::NotFound(_) => 1,
                RegistryError::Filtered => 1,
                RegistryError::Open(_) => 1,
            };
            let mut buf = Vec::new();
            OpHeader::reply(Opcode::RepImport, status).write_to(&mut buf)?;
            stream.write_all(&buf).await?;
            warn!(bus_id, error = %e, "import failed");
            Err(HandshakeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                e.to_string(),
            )))
        }
    }
}

fn write_device_record(buf: &mut Vec<u8>, record: &DeviceRecord) -> Result<(), HandshakeError> {
    write_fixed_str(buf, &record.path, 256);
    write_fixed_str(buf, &record.bus_id, 32);
    buf.extend_from_slice(&(record.bus_num as u32).to_be_bytes());
    buf.extend_from_slice(&(record.dev_num as u32).to_be_bytes());
    buf.extend_from_slice(&record.speed.to_be_bytes());
    buf.extend_from_slice(&record.vendor_id.to_be_bytes());
    buf.extend_from_slice(&record.product_id.to_be_bytes());
    buf.extend_from_slice(&record.bcd_device.to_be_bytes());
    buf.push(record.device_class);
    buf.push(record.device_subclass);
    buf.push(record.device_protocol);
    buf.push(record.configuration_value);
    buf.push(record.num_configurations);
    buf.push(record.interfaces.len() as u8);
    Ok(())
}

fn write_fixed_str(buf: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(width);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + (width - take), 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InterfaceRecord;

    fn sample_record() -> DeviceRecord {
        DeviceRecord {
            bus_id: "1-2".into(),
            path: "/sys/bus/usb/devices/1-2".into(),
            bus_num: 1,
            dev_num: 2,
            speed: 2,
            vendor_id: 0x1d6b,
            product_id: 0x0002,
            bcd_device: 0x0100,
            device_class: 9,
            device_subclass: 0,
            device_protocol: 1,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceRecord {
                interface_class: 9,
                interface_subclass: 0,
                interface_protocol: 0,
                endpoints: Vec::new(),
            }],
        }
    }

    #[test]
    fn fixed_str_truncates_and_pads() {
        let mut buf = Vec::new();
        write_fixed_str(&mut buf, "1-2", 8);
        assert_eq!(buf, b"1-2\0\0\0\0\0");
    }

    #[test]
    fn device_record_writes_fixed_layout() {
        let mut buf = Vec::new();
        write_device_record(&mut buf, &sample_record()).unwrap();
        // 256 (path) + 32 (busid) + 4*4 (bus/dev/speed) wait: bus_num,
        // dev_num, speed are u32 each = 3*4, then vid/pid/bcd = 3*u16 = 6,
        // then 6 u8 fields.
        let expected_len = 256 + 32 + 3 * 4 + 3 * 2 + 6;
        assert_eq!(buf.len(), expected_len);
    }

    #[test]
    fn bus_id_from_bytes_stops_at_nul() {
        let mut raw = [0u8; 32];
        raw[..3].copy_from_slice(b"1-2");
        assert_eq!(bus_id_from_bytes(&raw), "1-2");
    }

    #[tokio::test]
    async fn devlist_reply_starts_with_op_header() {
        struct FakeRegistry;
        impl DeviceRegistry for FakeRegistry {
            fn list_shared(&self) -> Vec<DeviceRecord> {
                vec![sample_record()]
            }
            fn try_reserve(
                &self,
                _bus_id: &str,
            ) -> Result<(DeviceRecord, crate::driver::DriverHandle), RegistryError> {
                unreachable!()
            }
            fn mark_detached(&self, _bus_id: &str) {}
        }

        let mut buf = Vec::new();
        reply_devlist(&mut buf, &FakeRegistry).await.unwrap();
        let header = OpHeader::read_from(&mut &buf[..protocol::wire::OP_HEADER_SIZE]).unwrap();
        assert_eq!(header.version, USBIP_VERSION);
        assert_eq!(header.opcode().unwrap(), Opcode::RepDevlist);
    }
}
