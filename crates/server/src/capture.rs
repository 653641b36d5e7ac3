//! Diagnostic capture sink (spec.md §6).
//!
//! Four write points in the engine — inbound command header, inbound
//! submit payload, outbound reply header, outbound reply payload — are
//! mirrored to an optional sink for offline inspection. A capture failure
//! is never allowed to affect the protocol session: sinks log at `warn!`
//! and swallow the error.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// The four diagnostic write points spec.md §6 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePoint {
    InboundHeader,
    InboundPayload,
    OutboundHeader,
    OutboundPayload,
}

pub trait CaptureSink: Send + Sync {
    fn write(&self, point: CapturePoint, bytes: &[u8]);
}

/// Default sink: discards everything. Used when `--capture` isn't given.
pub struct NullSink;

impl CaptureSink for NullSink {
    fn write(&self, _point: CapturePoint, _bytes: &[u8]) {}
}

/// Appends length-prefixed frames (`point: u8`, `len: u32 LE`, `bytes`)
/// to a file, one per write.
pub struct FileCaptureSink {
    file: Mutex<std::fs::File>,
}

impl FileCaptureSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<FileCaptureSink> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileCaptureSink {
            file: Mutex::new(file),
        })
    }
}

impl CaptureSink for FileCaptureSink {
    fn write(&self, point: CapturePoint, bytes: &[u8]) {
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(_) => {
                warn!("capture sink mutex poisoned, dropping frame");
                return;
            }
        };
        let marker = point as u8;
        let len = (bytes.len() as u32).to_le_bytes();
        let result = file
            .write_all(&[marker])
            .and_then(|_| file.write_all(&len))
            .and_then(|_| file.write_all(bytes));
        if let Err(e) = result {
            warn!("capture sink write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_does_not_panic() {
        NullSink.write(CapturePoint::InboundHeader, &[1, 2, 3]);
    }

    #[test]
    fn file_sink_appends_length_prefixed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let sink = FileCaptureSink::open(&path).unwrap();
        sink.write(CapturePoint::InboundHeader, &[1, 2, 3, 4]);
        sink.write(CapturePoint::OutboundPayload, &[9]);

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents[0], CapturePoint::InboundHeader as u8);
        assert_eq!(&contents[1..5], &4u32.to_le_bytes());
        assert_eq!(&contents[5..9], &[1, 2, 3, 4]);
        assert_eq!(contents[9], CapturePoint::OutboundPayload as u8);
    }
}
