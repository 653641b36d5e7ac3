//! Isochronous submit splitting and rejoining (spec.md §4.9).
//!
//! The driver adapter accepts at most 8 packets and 65535 cumulative
//! bytes per `send_urb` call; a CMD_SUBMIT with more packets or bytes
//! than that is split into multiple sub-URBs, submitted concurrently,
//! and their per-packet results rejoined into one RET_SUBMIT.

use crate::driver::{DriverError, DriverHandle, IsoResult, UrbOutcome};
use protocol::errno::DriverStatus;
use protocol::wire::{IsoPacketDescriptor, SubmitTrailer};

const MAX_PACKETS_PER_SUB_URB: usize = 8;
const MAX_BYTES_PER_SUB_URB: u64 = 65_535;

struct SubUrb {
    packet_lengths: Vec<u32>,
    out_data: Vec<u8>,
}

fn split(out_data: &[u8], descriptors: &[IsoPacketDescriptor], direction_in: bool) -> Vec<SubUrb> {
    let mut sub_urbs = Vec::new();
    let mut current_lengths = Vec::new();
    let mut current_bytes: u64 = 0;
    let mut offset = 0usize;

    for descriptor in descriptors {
        let would_overflow_count = current_lengths.len() >= MAX_PACKETS_PER_SUB_URB;
        let would_overflow_bytes =
            current_bytes + descriptor.length as u64 > MAX_BYTES_PER_SUB_URB;
        if !current_lengths.is_empty() && (would_overflow_count || would_overflow_bytes) {
            sub_urbs.push(finish_sub_urb(
                &mut current_lengths,
                &mut current_bytes,
                out_data,
                &mut offset,
                direction_in,
            ));
        }
        current_lengths.push(descriptor.length);
        current_bytes += descriptor.length as u64;
    }
    if !current_lengths.is_empty() {
        sub_urbs.push(finish_sub_urb(
            &mut current_lengths,
            &mut current_bytes,
            out_data,
            &mut offset,
            direction_in,
        ));
    }
    sub_urbs
}

fn finish_sub_urb(
    lengths: &mut Vec<u32>,
    bytes: &mut u64,
    out_data: &[u8],
    offset: &mut usize,
    direction_in: bool,
) -> SubUrb {
    let taken_lengths = std::mem::take(lengths);
    let taken_bytes = *bytes as usize;
    *bytes = 0;
    let chunk = if direction_in {
        Vec::new()
    } else {
        let slice = &out_data[*offset..*offset + taken_bytes];
        *offset += taken_bytes;
        slice.to_vec()
    };
    SubUrb {
        packet_lengths: taken_lengths,
        out_data: chunk,
    }
}

/// Submit an isochronous CMD_SUBMIT, splitting as needed and rejoining
/// results into a single outcome.
pub async fn submit(
    driver: &DriverHandle,
    endpoint: u8,
    direction_in: bool,
    trailer: &SubmitTrailer,
    out_data: Vec<u8>,
    descriptors: &[IsoPacketDescriptor],
) -> Result<UrbOutcome, DriverError> {
    let sub_urbs = split(&out_data, descriptors, direction_in);
    let sub_urb_packet_counts: Vec<usize> = sub_urbs.iter().map(|s| s.packet_lengths.len()).collect();

    let futures = sub_urbs.into_iter().map(|sub| {
        driver.submit_isochronous(endpoint, direction_in, sub.packet_lengths, sub.out_data)
    });
    let results: Vec<Result<UrbOutcome, DriverError>> = futures::future::join_all(futures).await;

    rejoin(results, &sub_urb_packet_counts, descriptors, trailer.transfer_buffer_length, direction_in)
}

fn rejoin(
    results: Vec<Result<UrbOutcome, DriverError>>,
    sub_urb_packet_counts: &[usize],
    descriptors: &[IsoPacketDescriptor],
    original_buffer_length: u32,
    direction_in: bool,
) -> Result<UrbOutcome, DriverError> {
    let mut data = Vec::new();
    let mut iso_results = Vec::with_capacity(descriptors.len());
    let mut overall_status = DriverStatus::Ok;
    let mut actual_length: u32 = 0;
    let mut descriptor_offset = 0usize;

    for (result, &packet_count) in results.into_iter().zip(sub_urb_packet_counts) {
        let outcome = result?;
        if !matches!(outcome.status, DriverStatus::Ok) && matches!(overall_status, DriverStatus::Ok) {
            overall_status = outcome.status;
        }
        actual_length += outcome.actual_length;
        if direction_in {
            data.extend_from_slice(&outcome.data);
        }
        if outcome.iso_results.is_empty() {
            // The driver adapter's simplified completion path doesn't
            // surface per-packet detail, only one actual_length/status for
            // the whole sub-URB; distribute it over the packets it covered
            // the same way a real short ISO read fills packets in order
            // before running out of data.
            let mut remaining = outcome.actual_length;
            for descriptor in &descriptors[descriptor_offset..descriptor_offset + packet_count] {
                let packet_actual = remaining.min(descriptor.length);
                remaining -= packet_actual;
                iso_results.push(IsoResult {
                    actual_length: packet_actual,
                    status: outcome.status,
                });
            }
        } else {
            iso_results.extend(outcome.iso_results);
        }
        descriptor_offset += packet_count;
    }

    // Short-read compaction (spec.md §4.9): only compact the data buffer
    // when the sum of actual lengths came in under what was requested —
    // otherwise the buffer is already exactly sized and compaction would
    // be a no-op that risks disturbing packet boundaries a client relies on.
    if direction_in && (actual_length as u64) < original_buffer_length as u64 {
        data.truncate(actual_length as usize);
    }

    Ok(UrbOutcome {
        status: overall_status,
        actual_length,
        iso_results,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(length: u32) -> IsoPacketDescriptor {
        IsoPacketDescriptor {
            offset: 0,
            length,
            actual_length: 0,
            status: 0,
        }
    }

    #[test]
    fn split_respects_packet_count_limit() {
        let descriptors: Vec<_> = (0..20).map(|_| descriptor(100)).collect();
        let out_data = Vec::new();
        let sub_urbs = split(&out_data, &descriptors, true);
        assert_eq!(sub_urbs.len(), 3); // 8 + 8 + 4
        assert_eq!(sub_urbs[0].packet_lengths.len(), 8);
        assert_eq!(sub_urbs[2].packet_lengths.len(), 4);
    }

    #[test]
    fn split_respects_byte_limit() {
        let descriptors = vec![descriptor(40_000), descriptor(40_000)];
        let out_data = Vec::new();
        let sub_urbs = split(&out_data, &descriptors, true);
        assert_eq!(sub_urbs.len(), 2);
    }

    #[test]
    fn split_assigns_out_data_slices_in_order() {
        let descriptors = vec![descriptor(2), descriptor(2)];
        let out_data = vec![1, 2, 3, 4];
        let sub_urbs = split(&out_data, &descriptors, false);
        assert_eq!(sub_urbs.len(), 1);
        assert_eq!(sub_urbs[0].out_data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejoin_sums_actual_length_and_concatenates_data() {
        let results = vec![
            Ok(UrbOutcome {
                status: DriverStatus::Ok,
                actual_length: 2,
                iso_results: Vec::new(),
                data: vec![1, 2],
            }),
            Ok(UrbOutcome {
                status: DriverStatus::Ok,
                actual_length: 2,
                iso_results: Vec::new(),
                data: vec![3, 4],
            }),
        ];
        let descriptors = vec![descriptor(2), descriptor(2)];
        let joined = rejoin(results, &[1, 1], &descriptors, 4, true).unwrap();
        assert_eq!(joined.actual_length, 4);
        assert_eq!(joined.data, vec![1, 2, 3, 4]);
        assert_eq!(joined.status, DriverStatus::Ok);
    }

    #[test]
    fn rejoin_compacts_on_short_read() {
        let results = vec![Ok(UrbOutcome {
            status: DriverStatus::Ok,
            actual_length: 2,
            iso_results: Vec::new(),
            data: vec![1, 2, 0, 0],
        })];
        let descriptors = vec![descriptor(4)];
        let joined = rejoin(results, &[1], &descriptors, 4, true).unwrap();
        assert_eq!(joined.data, vec![1, 2]);
    }

    #[test]
    fn rejoin_surfaces_first_error_status() {
        let results = vec![
            Ok(UrbOutcome {
                status: DriverStatus::Ok,
                actual_length: 2,
                iso_results: Vec::new(),
                data: vec![1, 2],
            }),
            Ok(UrbOutcome {
                status: DriverStatus::CrcError,
                actual_length: 0,
                iso_results: Vec::new(),
                data: Vec::new(),
            }),
        ];
        let descriptors = vec![descriptor(2), descriptor(2)];
        let joined = rejoin(results, &[1, 1], &descriptors, 4, true).unwrap();
        assert_eq!(joined.status, DriverStatus::CrcError);
    }

    #[test]
    fn rejoin_synthesizes_one_iso_result_per_original_packet() {
        // One sub-URB covering 3 packets (e.g. they fit under the driver's
        // 8-packet/65535-byte limit and got merged into a single send_urb);
        // iso_results must still come out one-per-original-packet, not
        // one-per-sub-URB, so the RET_SUBMIT descriptor array lines up with
        // the client's original request.
        let results = vec![Ok(UrbOutcome {
            status: DriverStatus::Ok,
            actual_length: 6,
            iso_results: Vec::new(),
            data: vec![0; 6],
        })];
        let descriptors = vec![descriptor(2), descriptor(2), descriptor(2)];
        let joined = rejoin(results, &[3], &descriptors, 6, true).unwrap();
        assert_eq!(joined.iso_results.len(), 3);
        assert!(joined.iso_results.iter().all(|r| r.actual_length == 2));
    }

    #[test]
    fn rejoin_short_sub_urb_fills_packets_in_order_then_zeros() {
        // Sub-URB reports less actual_length than its packets requested;
        // earlier packets should absorb the shortfall's complement, later
        // ones read as empty, mirroring a real short ISO read.
        let results = vec![Ok(UrbOutcome {
            status: DriverStatus::Ok,
            actual_length: 2,
            iso_results: Vec::new(),
            data: vec![0; 2],
        })];
        let descriptors = vec![descriptor(2), descriptor(2), descriptor(2)];
        let joined = rejoin(results, &[3], &descriptors, 6, true).unwrap();
        assert_eq!(
            joined.iso_results.iter().map(|r| r.actual_length).collect::<Vec<_>>(),
            vec![2, 0, 0]
        );
    }
}
