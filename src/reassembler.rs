//! Turns arbitrarily fragmented socket reads into whole packets.
//!
//! Bytes are appended to a ring sized at [`defaults::RING_MULTIPLIER`] read
//! chunks. A frame is only consumed once the header has been peeked and the
//! full `HEADER_SIZE + payload_len` bytes are buffered, so a frame may span
//! any number of reads and a single read may complete several frames.

use crate::error::FrameError;
use crate::packet::{Packet, PacketHeader};
use crate::protocol::{defaults, HEADER_SIZE};
use crate::ring::RingBuffer;
use tracing::warn;

pub struct Reassembler {
    ring: RingBuffer,
    scratch: Vec<u8>,
    resets: u64,
}

impl Reassembler {
    /// Ring sized for `read_chunk_size`-byte socket reads
    pub fn new(read_chunk_size: usize) -> Self {
        Self::with_capacity(read_chunk_size.max(1) * defaults::RING_MULTIPLIER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Reassembler {
            ring: RingBuffer::with_capacity(capacity),
            scratch: Vec::new(),
            resets: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.ring.write(bytes);
    }

    /// Append `bytes` and iterate over every frame that is now complete
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.push(bytes);
        Frames {
            inner: self,
            failed: false,
        }
    }

    /// Next complete packet, `Ok(None)` if more bytes are needed.
    ///
    /// A header with an unsupported version is returned as an error and left
    /// in the buffer: the stream cannot be resynchronised past it. A frame
    /// that arrives in full but fails to decode (an encoding other than
    /// none) resets the buffer, dropping whatever followed it.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, FrameError> {
        if self.ring.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut head = [0u8; HEADER_SIZE];
        self.ring.peek(&mut head);
        let header = PacketHeader::decode(&head)?;

        let frame_len = header.frame_len();
        if self.ring.len() < frame_len {
            return Ok(None);
        }

        self.scratch.resize(frame_len, 0);
        self.ring.read(&mut self.scratch[..frame_len]);

        match Packet::decode(&self.scratch[..frame_len]) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                self.resets += 1;
                warn!(
                    error = %e,
                    discarded = self.ring.len(),
                    resets = self.resets,
                    "corrupt frame, resetting reassembly buffer"
                );
                self.ring.reset();
                Ok(None)
            }
        }
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Number of times corrupt data forced a buffer reset
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// Iterator over frames completed by one [`Reassembler::feed`] call.
/// Stops after yielding the first error.
pub struct Frames<'a> {
    inner: &'a mut Reassembler,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Packet, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next_packet() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Opcode, PrepareDiskPayload, UpdateDataPayload};
    use crate::user_id::UserId;
    use proptest::prelude::*;

    fn update_packet(data_len: usize) -> Packet {
        let payload = UpdateDataPayload {
            total: data_len as u64,
            offset: 0,
            path: "dir/file.bin".to_string(),
            data: (0..data_len).map(|i| (i % 251) as u8).collect(),
        };
        Packet::update_data(UserId::new(), &payload).unwrap()
    }

    fn drain(reassembler: &mut Reassembler, bytes: &[u8]) -> Vec<Packet> {
        reassembler.feed(bytes).collect::<Result<Vec<_>, _>>().unwrap()
    }

    #[test]
    fn test_one_byte_reads_yield_one_packet() {
        let packet = update_packet(300);
        let bytes = packet.encode();
        let mut reassembler = Reassembler::new(64);

        let mut out = Vec::new();
        for b in &bytes {
            out.extend(drain(&mut reassembler, std::slice::from_ref(b)));
        }

        assert_eq!(out, vec![packet]);
        assert_eq!(reassembler.buffered(), 0);
    }

    proptest! {
        #[test]
        fn test_arbitrary_fragmentation_yields_identical_packet(
            data_len in 0usize..2000,
            cuts in proptest::collection::vec(1usize..97, 1..64),
        ) {
            let packet = update_packet(data_len);
            let bytes = packet.encode();
            let mut reassembler = Reassembler::new(16);

            let mut out = Vec::new();
            let mut at = 0;
            for step in cuts.iter().cycle() {
                if at >= bytes.len() {
                    break;
                }
                let end = (at + step).min(bytes.len());
                out.extend(drain(&mut reassembler, &bytes[at..end]));
                at = end;
            }

            prop_assert_eq!(out, vec![packet]);
        }
    }

    #[test]
    fn test_two_frames_in_one_read_come_out_in_order() {
        let first = update_packet(10);
        let second = Packet::prepare_disk(UserId::new(), &PrepareDiskPayload { disk_size_mib: 64 });
        let mut bytes = first.encode();
        bytes.extend(second.encode());

        let mut reassembler = Reassembler::new(1024);
        assert_eq!(drain(&mut reassembler, &bytes), vec![first, second]);
    }

    #[test]
    fn test_partial_header_waits() {
        let packet = Packet::pull_data(UserId::new());
        let bytes = packet.encode();
        let mut reassembler = Reassembler::new(1024);

        assert!(drain(&mut reassembler, &bytes[..HEADER_SIZE - 1]).is_empty());
        assert_eq!(drain(&mut reassembler, &bytes[HEADER_SIZE - 1..]), vec![packet]);
    }

    #[test]
    fn test_frame_tail_split_across_reads() {
        let first = update_packet(50);
        let second = update_packet(70);
        let mut bytes = first.encode();
        bytes.extend(second.encode());
        let cut = first.encode().len() + 5;

        let mut reassembler = Reassembler::new(1024);
        assert_eq!(drain(&mut reassembler, &bytes[..cut]), vec![first]);
        assert_eq!(reassembler.buffered(), 5);
        assert_eq!(drain(&mut reassembler, &bytes[cut..]), vec![second]);
    }

    #[test]
    fn test_frames_larger_than_the_ring_still_reassemble() {
        let packet = update_packet(60_000);
        let bytes = packet.encode();
        let mut reassembler = Reassembler::with_capacity(128);

        let mut out = Vec::new();
        for chunk in bytes.chunks(1000) {
            out.extend(drain(&mut reassembler, chunk));
        }
        assert_eq!(out, vec![packet]);
    }

    #[test]
    fn test_bad_version_is_reported_once() {
        let mut bytes = Packet::pull_data(UserId::new()).encode();
        bytes[0] = 0xFF;
        let mut reassembler = Reassembler::new(64);

        let results: Vec<_> = reassembler.feed(&bytes).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FrameError::UnsupportedProtocolVersion { received: 0xFF, .. })
        ));
    }

    #[test]
    fn test_undecodable_frame_resets_buffer() {
        let mut bytes = update_packet(20).encode();
        bytes[2] = 3;
        bytes.extend(Packet::pull_data(UserId::new()).encode());
        let mut reassembler = Reassembler::new(64);

        assert!(drain(&mut reassembler, &bytes).is_empty());
        assert_eq!(reassembler.resets(), 1);
        assert_eq!(reassembler.buffered(), 0);

        let next = update_packet(5);
        assert_eq!(drain(&mut reassembler, &next.encode()), vec![next]);
        assert_eq!(reassembler.resets(), 1);
    }

    #[test]
    fn test_unknown_opcode_is_not_a_framing_error() {
        let mut packet_bytes = Packet::new(Opcode::PullData, UserId::new(), vec![1, 2, 3])
            .unwrap()
            .encode();
        packet_bytes[1] = 9;
        let mut reassembler = Reassembler::new(64);
        let out = drain(&mut reassembler, &packet_bytes);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header().opcode, 9);
    }
}
