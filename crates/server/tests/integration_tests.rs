//! Server integration tests (spec.md §8): a real loopback TCP client
//! driving the actual accept loop (`usbip_server::net::serve_listener`),
//! asserting on raw wire bytes — the same style as the teacher's
//! `server/tests/integration_tests.rs` (a mock/loopback client against
//! the real connection-handling code, not a reimplementation of it).

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use usbip_server::capture::NullSink;
use usbip_server::driver::DriverHandle;
use usbip_server::net::serve_listener;
use usbip_server::registry::{
    DeviceRecord, DeviceRegistry, EndpointRecord, EndpointTransferType, InterfaceRecord,
    RegistryError,
};

/// A `DeviceRegistry` double exposing a fixed, in-memory device list.
/// `try_reserve` hands back a `DriverHandle` spawned against an invalid
/// fd (`-1`): every ioctl it attempts fails fast with `EBADF` rather than
/// blocking, which is enough to exercise protocol framing without real
/// hardware — these tests assert on wire-level behavior, not on an
/// actual USB transfer completing.
struct FakeRegistry {
    devices: Vec<DeviceRecord>,
}

impl FakeRegistry {
    fn with_one_device() -> FakeRegistry {
        FakeRegistry {
            devices: vec![DeviceRecord {
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
                    endpoints: vec![EndpointRecord {
                        address: 0x81,
                        transfer_type: EndpointTransferType::Bulk,
                        max_packet_size: 512,
                        interval: 0,
                    }],
                }],
            }],
        }
    }
}

impl DeviceRegistry for FakeRegistry {
    fn list_shared(&self) -> Vec<DeviceRecord> {
        self.devices.clone()
    }

    fn try_reserve(&self, bus_id: &str) -> Result<(DeviceRecord, DriverHandle), RegistryError> {
        let record = self
            .devices
            .iter()
            .find(|d| d.bus_id == bus_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(bus_id.to_string()))?;
        Ok((record, DriverHandle::spawn(-1)))
    }

    fn mark_detached(&self, _bus_id: &str) {}
}

/// Spin up the real accept loop on an ephemeral port, returning the
/// address to connect to and a shutdown handle to tear it down.
async fn spawn_server(registry: FakeRegistry) -> (std::net::SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = serve_listener(listener, Arc::new(registry), Arc::new(NullSink), task_shutdown).await;
    });
    (addr, shutdown)
}

const OP_VERSION: u16 = 0x0111;
const OP_REQ_DEVLIST: u16 = 0x8005;
const OP_REP_DEVLIST: u16 = 0x0005;
const OP_REQ_IMPORT: u16 = 0x8003;
const OP_REP_IMPORT: u16 = 0x0003;

fn op_header(opcode: u16) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..2].copy_from_slice(&OP_VERSION.to_be_bytes());
    buf[2..4].copy_from_slice(&opcode.to_be_bytes());
    buf[4..8].copy_from_slice(&0u32.to_be_bytes());
    buf
}

fn bus_id_field(bus_id: &str) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let bytes = bus_id.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

#[tokio::test]
async fn devlist_handshake_reports_the_registered_device() {
    let (addr, shutdown) = spawn_server(FakeRegistry::with_one_device()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&op_header(OP_REQ_DEVLIST)).await.unwrap();

    let mut reply_header = [0u8; 8];
    stream.read_exact(&mut reply_header).await.unwrap();
    assert_eq!(u16::from_be_bytes([reply_header[0], reply_header[1]]), OP_VERSION);
    assert_eq!(u16::from_be_bytes([reply_header[2], reply_header[3]]), OP_REP_DEVLIST);

    let mut count_buf = [0u8; 4];
    stream.read_exact(&mut count_buf).await.unwrap();
    assert_eq!(u32::from_be_bytes(count_buf), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn import_of_unknown_bus_id_reports_failure_status() {
    let (addr, shutdown) = spawn_server(FakeRegistry::with_one_device()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&op_header(OP_REQ_IMPORT)).await.unwrap();
    stream.write_all(&bus_id_field("9-9")).await.unwrap();

    let mut reply_header = [0u8; 8];
    stream.read_exact(&mut reply_header).await.unwrap();
    assert_eq!(u16::from_be_bytes([reply_header[2], reply_header[3]]), OP_REP_IMPORT);
    assert_eq!(u32::from_be_bytes([reply_header[4], reply_header[5], reply_header[6], reply_header[7]]), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn import_of_known_bus_id_succeeds_and_accepts_submit_traffic() {
    let (addr, shutdown) = spawn_server(FakeRegistry::with_one_device()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&op_header(OP_REQ_IMPORT)).await.unwrap();
    stream.write_all(&bus_id_field("1-2")).await.unwrap();

    let mut reply_header = [0u8; 8];
    stream.read_exact(&mut reply_header).await.unwrap();
    assert_eq!(u16::from_be_bytes([reply_header[2], reply_header[3]]), OP_REP_IMPORT);
    assert_eq!(u32::from_be_bytes([reply_header[4], reply_header[5], reply_header[6], reply_header[7]]), 0);

    // Drain the device record payload the handshake writes after the
    // OpHeader (256-byte path + 32-byte bus id + fixed numeric fields +
    // per-interface records); we only care that the connection stays
    // open afterwards and accepts a CMD_UNLINK for an unknown seqnum.
    let mut record_buf = vec![0u8; 312];
    stream.read_exact(&mut record_buf).await.unwrap();
    let interface_count = record_buf[311];
    let mut interfaces_buf = vec![0u8; interface_count as usize * 4];
    stream.read_exact(&mut interfaces_buf).await.unwrap();

    // CMD_UNLINK targeting a seqnum nobody submitted: expect -ENOENT.
    let mut unlink = Vec::new();
    unlink.extend_from_slice(&2u32.to_be_bytes()); // command = CMD_UNLINK
    unlink.extend_from_slice(&1u32.to_be_bytes()); // seqnum
    unlink.extend_from_slice(&0u32.to_be_bytes()); // devid
    unlink.extend_from_slice(&0u32.to_be_bytes()); // direction
    unlink.extend_from_slice(&0u32.to_be_bytes()); // ep
    unlink.extend_from_slice(&999u32.to_be_bytes()); // unlink trailer: target seqnum
    unlink.extend_from_slice(&[0u8; 24]); // unlink trailer padding
    stream.write_all(&unlink).await.unwrap();

    let mut ret_header = [0u8; 20];
    stream.read_exact(&mut ret_header).await.unwrap();
    assert_eq!(u32::from_be_bytes([ret_header[0], ret_header[1], ret_header[2], ret_header[3]]), 4); // RET_UNLINK
    assert_eq!(u32::from_be_bytes([ret_header[4], ret_header[5], ret_header[6], ret_header[7]]), 1);

    let mut ret_trailer = [0u8; 28];
    stream.read_exact(&mut ret_trailer).await.unwrap();
    let status = i32::from_be_bytes([ret_trailer[0], ret_trailer[1], ret_trailer[2], ret_trailer[3]]);
    assert_eq!(status, -2); // -ENOENT: nothing was pending for seqnum 999

    shutdown.cancel();
}
