//! USB/IP wire structures and their big-endian encoding.
//!
//! Mirrors the layout documented in the Linux kernel at
//! `drivers/usb/usbip/usbip_common.h`: a 20-byte basic header, followed by
//! a 28-byte command-specific trailer (submit, ret-submit, or unlink),
//! for a fixed 48-byte USB/IP header overall. Isochronous submits are
//! additionally followed by `number_of_packets` 16-byte packet descriptors.
//!
//! All integers on the wire are big-endian; this module is the only place
//! that byte-swaps.

use crate::error::{Result, WireError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// USB/IP protocol version used by this server (`0x0111`, version 1.1.1).
pub const USBIP_VERSION: u16 = 0x0111;

/// Size of the basic header on the wire.
pub const BASIC_HEADER_SIZE: usize = 20;
/// Size of a submit/ret-submit trailer (and the unlink trailer, zero-padded).
pub const TRAILER_SIZE: usize = 28;
/// Combined size of a USB/IP command header (basic header + trailer).
pub const HEADER_SIZE: usize = BASIC_HEADER_SIZE + TRAILER_SIZE;
/// Size of one isochronous packet descriptor.
pub const ISO_DESC_SIZE: usize = 16;
/// Size of the handshake op-header (version, opcode, status).
pub const OP_HEADER_SIZE: usize = 8;

/// Direction of a transfer as carried in the basic header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_wire(value: u32) -> Direction {
        if value == 0 { Direction::Out } else { Direction::In }
    }

    pub fn is_in(self) -> bool {
        matches!(self, Direction::In)
    }
}

/// USB/IP command codes carried in `BasicHeader::command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CmdSubmit,
    RetSubmit,
    CmdUnlink,
    RetUnlink,
}

impl Command {
    pub fn to_wire(self) -> u32 {
        match self {
            Command::CmdSubmit => 0x0001,
            Command::RetSubmit => 0x0003,
            Command::CmdUnlink => 0x0002,
            Command::RetUnlink => 0x0004,
        }
    }

    pub fn from_wire(value: u32) -> Result<Command> {
        match value {
            0x0001 => Ok(Command::CmdSubmit),
            0x0003 => Ok(Command::RetSubmit),
            0x0002 => Ok(Command::CmdUnlink),
            0x0004 => Ok(Command::RetUnlink),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// The 20-byte header common to every USB/IP command (five `u32` fields,
/// per `usbip_common.h: usbip_header_basic`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl BasicHeader {
    /// Build a basic header for an outgoing RET_SUBMIT/RET_UNLINK.
    ///
    /// Per spec, `devid`, `direction`, and `ep` are zeroed on replies: the
    /// client already has seqnum context from the original submit.
    pub fn for_reply(command: Command, seqnum: u32) -> BasicHeader {
        BasicHeader {
            command: command.to_wire(),
            seqnum,
            devid: 0,
            direction: 0,
            ep: 0,
        }
    }

    pub fn command(&self) -> Result<Command> {
        Command::from_wire(self.command)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<BasicHeader> {
        let command = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("basic header command"))?;
        let seqnum = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("basic header seqnum"))?;
        let devid = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("basic header devid"))?;
        let direction = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("basic header direction"))?;
        let ep = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("basic header ep"))?;
        Ok(BasicHeader {
            command,
            seqnum,
            devid,
            direction,
            ep,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<BigEndian>(self.command)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction)?;
        writer.write_u32::<BigEndian>(self.ep)
    }
}

/// The 28-byte trailer of a CMD_SUBMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitTrailer {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl SubmitTrailer {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<SubmitTrailer> {
        let transfer_flags = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("submit trailer transfer_flags"))?;
        let transfer_buffer_length = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("submit trailer transfer_buffer_length"))?;
        let start_frame = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("submit trailer start_frame"))?;
        let number_of_packets = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("submit trailer number_of_packets"))?;
        let interval = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("submit trailer interval"))?;
        let mut setup = [0u8; 8];
        reader
            .read_exact(&mut setup)
            .map_err(|_| WireError::Truncated("submit trailer setup"))?;
        Ok(SubmitTrailer {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)
    }

    /// `true` if `number_of_packets` marks this as an isochronous submit.
    pub fn is_isochronous(&self) -> bool {
        self.number_of_packets > 0 && self.number_of_packets != 0xFFFF_FFFF
    }
}

/// Sentinel written into `RetSubmitTrailer::number_of_packets` for non-ISO replies.
pub const NON_ISO_NUMBER_OF_PACKETS: u32 = 0xFFFF_FFFF;

/// The 28-byte trailer of a RET_SUBMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmitTrailer {
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl RetSubmitTrailer {
    pub fn non_iso(status: i32, actual_length: u32) -> RetSubmitTrailer {
        RetSubmitTrailer {
            status,
            actual_length,
            start_frame: 0,
            number_of_packets: NON_ISO_NUMBER_OF_PACKETS,
            error_count: 0,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_u32::<BigEndian>(self.start_frame)?;
        writer.write_u32::<BigEndian>(self.number_of_packets)?;
        writer.write_u32::<BigEndian>(self.error_count)
    }

    #[cfg(test)]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<RetSubmitTrailer> {
        let status = reader
            .read_i32::<BigEndian>()
            .map_err(|_| WireError::Truncated("ret-submit status"))?;
        let actual_length = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("ret-submit actual_length"))?;
        let start_frame = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("ret-submit start_frame"))?;
        let number_of_packets = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("ret-submit number_of_packets"))?;
        let error_count = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("ret-submit error_count"))?;
        Ok(RetSubmitTrailer {
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
        })
    }
}

/// The 4-byte payload of a CMD_UNLINK, zero-padded to the 28-byte trailer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkTrailer {
    pub seqnum: u32,
}

impl UnlinkTrailer {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<UnlinkTrailer> {
        let seqnum = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("unlink trailer seqnum"))?;
        let mut padding = [0u8; TRAILER_SIZE - 4];
        reader
            .read_exact(&mut padding)
            .map_err(|_| WireError::Truncated("unlink trailer padding"))?;
        Ok(UnlinkTrailer { seqnum })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_all(&[0u8; TRAILER_SIZE - 4])
    }
}

/// RET_UNLINK's trailer mirrors CMD_UNLINK's shape: a status in the first
/// field, the rest reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlinkTrailer {
    pub status: i32,
}

impl RetUnlinkTrailer {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_all(&[0u8; TRAILER_SIZE - 4])
    }

    #[cfg(test)]
    pub fn read_from<R: Read>(reader: &mut R) -> Result<RetUnlinkTrailer> {
        let status = reader
            .read_i32::<BigEndian>()
            .map_err(|_| WireError::Truncated("ret-unlink status"))?;
        let mut padding = [0u8; TRAILER_SIZE - 4];
        reader
            .read_exact(&mut padding)
            .map_err(|_| WireError::Truncated("ret-unlink padding"))?;
        Ok(RetUnlinkTrailer { status })
    }
}

/// One 16-byte isochronous packet descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<IsoPacketDescriptor> {
        let offset = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("iso descriptor offset"))?;
        let length = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("iso descriptor length"))?;
        let actual_length = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("iso descriptor actual_length"))?;
        let status = reader
            .read_i32::<BigEndian>()
            .map_err(|_| WireError::Truncated("iso descriptor status"))?;
        Ok(IsoPacketDescriptor {
            offset,
            length,
            actual_length,
            status,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)
    }
}

/// Read `count` iso packet descriptors from `reader`.
pub fn read_iso_descriptors<R: Read>(
    reader: &mut R,
    count: u32,
) -> Result<Vec<IsoPacketDescriptor>> {
    (0..count)
        .map(|_| IsoPacketDescriptor::read_from(reader))
        .collect()
}

/// Write a slice of iso packet descriptors.
pub fn write_iso_descriptors<W: Write>(
    writer: &mut W,
    descriptors: &[IsoPacketDescriptor],
) -> std::io::Result<()> {
    for d in descriptors {
        d.write_to(writer)?;
    }
    Ok(())
}

/// Handshake opcodes carried in the 8-byte op-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ReqDevlist,
    RepDevlist,
    ReqImport,
    RepImport,
}

impl Opcode {
    pub fn to_wire(self) -> u16 {
        match self {
            Opcode::ReqDevlist => 0x8005,
            Opcode::RepDevlist => 0x0005,
            Opcode::ReqImport => 0x8003,
            Opcode::RepImport => 0x0003,
        }
    }

    pub fn from_wire(value: u16) -> Result<Opcode> {
        match value {
            0x8005 => Ok(Opcode::ReqDevlist),
            0x0005 => Ok(Opcode::RepDevlist),
            0x8003 => Ok(Opcode::ReqImport),
            0x0003 => Ok(Opcode::RepImport),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

/// The 8-byte header preceding every handshake-phase message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub opcode: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn request(opcode: Opcode) -> OpHeader {
        OpHeader {
            version: USBIP_VERSION,
            opcode: opcode.to_wire(),
            status: 0,
        }
    }

    pub fn reply(opcode: Opcode, status: u32) -> OpHeader {
        OpHeader {
            version: USBIP_VERSION,
            opcode: opcode.to_wire(),
            status,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<OpHeader> {
        let version = reader
            .read_u16::<BigEndian>()
            .map_err(|_| WireError::Truncated("op header version"))?;
        let opcode = reader
            .read_u16::<BigEndian>()
            .map_err(|_| WireError::Truncated("op header opcode"))?;
        let status = reader
            .read_u32::<BigEndian>()
            .map_err(|_| WireError::Truncated("op header status"))?;
        if version != USBIP_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        Ok(OpHeader {
            version,
            opcode,
            status,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.opcode)?;
        writer.write_u32::<BigEndian>(self.status)
    }

    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::from_wire(self.opcode)
    }
}

/// Validate the invariants of an isochronous submit's packet descriptors
/// against the driver's per-packet length limit (spec.md §4.9).
pub fn validate_iso_lengths(
    descriptors: &[IsoPacketDescriptor],
    transfer_buffer_length: u32,
    max_packet_length: u32,
) -> Result<()> {
    let mut sum: u64 = 0;
    for d in descriptors {
        if d.length > max_packet_length {
            return Err(WireError::IsoPacketTooLarge {
                length: d.length,
                limit: max_packet_length,
            });
        }
        sum += d.length as u64;
    }
    if sum != transfer_buffer_length as u64 {
        return Err(WireError::IsoLengthMismatch {
            sum,
            expected: transfer_buffer_length,
        });
    }
    Ok(())
}
