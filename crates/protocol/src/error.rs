//! Wire-level decode errors

use thiserror::Error;

/// Errors produced while decoding USB/IP wire structures.
///
/// These are always a protocol violation at the caller: bad framing, an
/// unrecognized command/opcode, or a header that failed a structural
/// invariant (e.g. an iso packet count that doesn't match the payload).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of stream while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported USB/IP version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("unknown command code {0:#010x}")]
    UnknownCommand(u32),

    #[error("unknown handshake opcode {0:#06x}")]
    UnknownOpcode(u16),

    #[error("iso packet length {length} exceeds the driver limit of {limit}")]
    IsoPacketTooLarge { length: u32, limit: u32 },

    #[error("iso packet lengths sum to {sum}, expected transfer_buffer_length {expected}")]
    IsoLengthMismatch { sum: u64, expected: u32 },
}

pub type Result<T> = std::result::Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WireError::UnsupportedVersion(0x0222);
        assert!(format!("{err}").contains("0x0222"));
    }

    #[test]
    fn test_iso_mismatch_display() {
        let err = WireError::IsoLengthMismatch {
            sum: 100,
            expected: 64,
        };
        let msg = format!("{err}");
        assert!(msg.contains("100"));
        assert!(msg.contains("64"));
    }
}
