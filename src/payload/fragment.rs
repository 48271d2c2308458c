//! Fragmenting payload discipline
//!
//! Frames larger than the fragment ceiling are split into fragmentation
//! units. Every packet carries a two-octet prefix: an indicator octet
//! `(F:1, NRI:2, Type:5)` with Type = 28, then a fragment-unit header
//! `(S:1, E:1, R:1, Type:5)` carrying the original unit type. Type 28 is
//! reserved for the fragmentation wrapping itself and never appears as a
//! unit type of application data.
//!
//! All fragments of one frame share one RTP timestamp and contiguous
//! sequence numbers; the end fragment also carries the RTP marker bit.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::error::Error;
use crate::frame::MediaFrame;
use crate::packet::RtpPacket;
use crate::{Result, RtpSequenceNumber, RtpTimestamp};

use super::PacketizedPayload;

/// Payload type value of the indicator octet marking a fragmentation unit
pub const FRAGMENT_UNIT_TYPE: u8 = 28;

/// Length of the per-packet fragment prefix in bytes
pub const FRAGMENT_PREFIX_SIZE: usize = 2;

/// `true` when timestamp `a` is newer than `b` in wrapping RTP time
fn ts_newer(a: RtpTimestamp, b: RtpTimestamp) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Formatter that splits frames into fragmentation units
#[derive(Debug, Clone)]
pub struct FragmentingFormat {
    /// Media bytes per fragment, prefix excluded
    fragment_size: usize,
}

impl FragmentingFormat {
    /// Create a fragmenting formatter with the given per-fragment ceiling
    pub fn new(fragment_size: usize) -> Self {
        Self {
            fragment_size: fragment_size.max(1),
        }
    }

    /// Split one frame into prefixed fragment payloads. A frame that fits
    /// under the ceiling still gets the prefix, with both the start and end
    /// flags set.
    pub fn packetize(&self, frame: Bytes) -> Result<Vec<PacketizedPayload>> {
        if frame.is_empty() {
            return Err(Error::InvalidValue("empty frame".to_string()));
        }

        let indicator = (frame[0] & 0xE0) | FRAGMENT_UNIT_TYPE;
        let unit_type = frame[0] & 0x1F;

        let count = (frame.len() + self.fragment_size - 1) / self.fragment_size;
        let mut packets = Vec::with_capacity(count);

        for i in 0..count {
            let begin = i * self.fragment_size;
            let end = (begin + self.fragment_size).min(frame.len());
            let chunk = frame.slice(begin..end);

            let start = i == 0;
            let last = i == count - 1;

            let mut fu_header = unit_type;
            if start {
                fu_header |= 1 << 7;
            }
            if last {
                fu_header |= 1 << 6;
            }

            let mut data = BytesMut::with_capacity(FRAGMENT_PREFIX_SIZE + chunk.len());
            data.put_u8(indicator);
            data.put_u8(fu_header);
            data.put_slice(&chunk);

            packets.push(PacketizedPayload {
                data: data.freeze(),
                marker: last,
            });
        }

        trace!("Fragmented {} bytes into {} units", frame.len(), count);
        Ok(packets)
    }
}

/// One partially reassembled frame, keyed by RTP timestamp
#[derive(Debug)]
struct Slot {
    /// Sequence number the fragment offsets are relative to
    base_seq: RtpSequenceNumber,

    /// Media chunks by offset from `base_seq`
    fragments: BTreeMap<u16, Bytes>,

    /// Offset of the start-flagged fragment, once seen
    start_offset: Option<u16>,

    /// Offset of the end-flagged fragment, once seen
    end_offset: Option<u16>,

    /// Highest offset inserted so far
    highest_offset: u16,

    payload_type: u8,
    ssrc: u32,
    created: Instant,
}

impl Slot {
    fn new(seq: RtpSequenceNumber, payload_type: u8, ssrc: u32, now: Instant) -> Self {
        Self {
            base_seq: seq,
            fragments: BTreeMap::new(),
            start_offset: None,
            end_offset: None,
            highest_offset: 0,
            payload_type,
            ssrc,
            created: now,
        }
    }

    /// Shift the offset origin down to `seq` so all offsets stay positive
    fn rebase(&mut self, seq: RtpSequenceNumber) {
        let delta = self.base_seq.wrapping_sub(seq);
        self.base_seq = seq;
        self.fragments = self
            .fragments
            .iter()
            .map(|(offset, chunk)| (offset + delta, chunk.clone()))
            .collect();
        self.start_offset = self.start_offset.map(|o| o + delta);
        self.end_offset = self.end_offset.map(|o| o + delta);
        self.highest_offset += delta;
    }

    fn insert(&mut self, seq: RtpSequenceNumber, chunk: Bytes, start: bool, end: bool) {
        let mut offset = seq.wrapping_sub(self.base_seq);
        if offset >= 0x8000 {
            // The fragment precedes the current origin
            self.rebase(seq);
            offset = 0;
        }

        if start {
            self.start_offset = Some(offset);
        }
        if end {
            self.end_offset = Some(offset);
        }
        if offset > self.highest_offset {
            self.highest_offset = offset;
        }

        self.fragments.insert(offset, chunk);
    }

    /// Complete when the start and end fragments are present and every
    /// sequence number between them accounted for
    fn is_complete(&self) -> bool {
        let (start, end) = match (self.start_offset, self.end_offset) {
            (Some(s), Some(e)) => (s, e),
            _ => return false,
        };
        if end < start {
            return false;
        }

        self.fragments.len() == (end - start + 1) as usize
            && self.fragments.keys().next() == Some(&start)
            && self.fragments.keys().next_back() == Some(&end)
    }

    fn into_frame(self, timestamp: RtpTimestamp) -> MediaFrame {
        let total: usize = self.fragments.values().map(|c| c.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for chunk in self.fragments.values() {
            payload.put_slice(chunk);
        }

        MediaFrame {
            payload: payload.freeze(),
            timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            marker: true,
        }
    }
}

/// Reassembles fragmentation units into frames
#[derive(Debug)]
pub struct FragmentReassembler {
    reorder_window: u16,
    retention: Duration,
    slots: HashMap<RtpTimestamp, Slot>,
    dropped_frames: u64,
    dropped_fragments: u64,
}

impl FragmentReassembler {
    /// Create a reassembler with the given reorder window and retention
    /// window for incomplete slots
    pub fn new(reorder_window: u16, retention: Duration) -> Self {
        Self {
            reorder_window,
            retention,
            slots: HashMap::new(),
            dropped_frames: 0,
            dropped_fragments: 0,
        }
    }

    /// Frames dropped without delivery (incomplete at flush or expiry)
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Fragments discarded for falling outside the reorder window
    pub fn dropped_fragments(&self) -> u64 {
        self.dropped_fragments
    }

    /// Feed one fragment packet; returns any frames it completed
    pub fn push(&mut self, packet: RtpPacket) -> Result<Vec<MediaFrame>> {
        let payload = &packet.payload;
        if payload.len() < FRAGMENT_PREFIX_SIZE {
            return Err(Error::InvalidPacket(format!(
                "fragment of {} bytes is shorter than its prefix",
                payload.len()
            )));
        }
        if payload[0] & 0x1F != FRAGMENT_UNIT_TYPE {
            return Err(Error::InvalidPacket(format!(
                "indicator type {} is not a fragmentation unit",
                payload[0] & 0x1F
            )));
        }

        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let chunk = payload.slice(FRAGMENT_PREFIX_SIZE..);

        let ts = packet.header.timestamp;
        let seq = packet.header.sequence_number;
        let now = Instant::now();

        let mut completed = Vec::new();

        self.expire(now);
        self.flush_older_than(ts, &mut completed);

        let discarded = {
            let slot = self
                .slots
                .entry(ts)
                .or_insert_with(|| Slot::new(seq, packet.header.payload_type, packet.header.ssrc, now));

            // Fragments lagging the slot's highest sequence number by more
            // than the reorder window are discarded
            let highest_seq = slot.base_seq.wrapping_add(slot.highest_offset);
            let lag = highest_seq.wrapping_sub(seq);
            if lag < 0x8000 && lag > self.reorder_window {
                true
            } else {
                slot.insert(seq, chunk, start, end);
                false
            }
        };

        if discarded {
            self.dropped_fragments += 1;
            debug!("Discarded fragment seq={} outside reorder window", seq);
            return Ok(completed);
        }

        if self.slots.get(&ts).map_or(false, |slot| slot.is_complete()) {
            let slot = self.slots.remove(&ts).unwrap();
            completed.push(slot.into_frame(ts));
        }

        Ok(completed)
    }

    /// Finalize every slot older than `ts`: deliver it if complete,
    /// otherwise drop it whole
    fn flush_older_than(&mut self, ts: RtpTimestamp, completed: &mut Vec<MediaFrame>) {
        let mut stale: Vec<RtpTimestamp> = self
            .slots
            .keys()
            .copied()
            .filter(|&t| ts_newer(ts, t))
            .collect();
        // Oldest first so delivery preserves timestamp order
        stale.sort_by_key(|&t| ts.wrapping_sub(t));
        stale.reverse();

        for t in stale {
            let slot = self.slots.remove(&t).unwrap();
            if slot.is_complete() {
                completed.push(slot.into_frame(t));
            } else {
                self.dropped_frames += 1;
                debug!("Dropped incomplete frame ts={} on timestamp advance", t);
            }
        }
    }

    /// Drop slots that have exceeded the retention window
    fn expire(&mut self, now: Instant) {
        let mut expired = 0u64;
        let retention = self.retention;
        self.slots.retain(|_, slot| {
            if now.duration_since(slot.created) > retention {
                expired += 1;
                false
            } else {
                true
            }
        });
        self.dropped_frames += expired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(
        payload: Bytes,
        seq: RtpSequenceNumber,
        ts: RtpTimestamp,
        marker: bool,
    ) -> RtpPacket {
        let mut packet = RtpPacket::new_with_payload(96, seq, ts, 0xfeedface, payload);
        packet.header.marker = marker;
        packet
    }

    fn reassembler() -> FragmentReassembler {
        FragmentReassembler::new(128, Duration::from_millis(500))
    }

    #[test]
    fn test_fragment_counts_and_flags() {
        // 16000 bytes at a 1400-byte ceiling: 11 full fragments plus one
        // 600-byte tail
        let frame = Bytes::from(vec![0x65u8; 16_000]);
        let fmt = FragmentingFormat::new(1400);
        let packets = fmt.packetize(frame).unwrap();

        assert_eq!(packets.len(), 12);
        assert_eq!(packets[0].data.len(), 1400 + FRAGMENT_PREFIX_SIZE);
        assert_eq!(packets[11].data.len(), 600 + FRAGMENT_PREFIX_SIZE);

        // First has the start flag and no marker
        assert_eq!(packets[0].data[1] & 0x80, 0x80);
        assert_eq!(packets[0].data[1] & 0x40, 0);
        assert!(!packets[0].marker);

        // Last has the end flag and the marker
        assert_eq!(packets[11].data[1] & 0x80, 0);
        assert_eq!(packets[11].data[1] & 0x40, 0x40);
        assert!(packets[11].marker);

        // Intermediates carry neither flag
        for packet in &packets[1..11] {
            assert_eq!(packet.data[1] & 0xC0, 0);
            assert!(!packet.marker);
        }

        // Indicator carries the FU type, original type preserved inside
        assert_eq!(packets[0].data[0] & 0x1F, FRAGMENT_UNIT_TYPE);
        assert_eq!(packets[0].data[1] & 0x1F, 0x65 & 0x1F);
    }

    #[test]
    fn test_roundtrip_in_order() {
        let frame: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let frame = Bytes::from(frame);

        let fmt = FragmentingFormat::new(1400);
        let packets = fmt.packetize(frame.clone()).unwrap();

        let mut reasm = reassembler();
        let mut frames = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            let packet = make_packet(p.data.clone(), 100 + i as u16, 30_000, p.marker);
            frames.extend(reasm.push(packet).unwrap());
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame);
        assert_eq!(frames[0].timestamp, 30_000);
        assert!(frames[0].marker);
    }

    #[test]
    fn test_small_frame_single_unit() {
        let frame = Bytes::from_static(b"short frame");
        let fmt = FragmentingFormat::new(1400);
        let packets = fmt.packetize(frame.clone()).unwrap();

        assert_eq!(packets.len(), 1);
        // Single unit carries both flags
        assert_eq!(packets[0].data[1] & 0xC0, 0xC0);

        let mut reasm = reassembler();
        let frames = reasm
            .push(make_packet(packets[0].data.clone(), 7, 1000, true))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame);
    }

    #[test]
    fn test_reorder_within_window() {
        // Swap the 3rd and 5th of a 10-fragment frame
        let frame = Bytes::from(vec![0x41u8; 10 * 1400]);
        let fmt = FragmentingFormat::new(1400);
        let packets = fmt.packetize(frame.clone()).unwrap();
        assert_eq!(packets.len(), 10);

        let mut order: Vec<usize> = (0..10).collect();
        order.swap(2, 4);

        let mut reasm = reassembler();
        let mut frames = Vec::new();
        for &i in &order {
            let packet = make_packet(packets[i].data.clone(), i as u16, 5000, packets[i].marker);
            frames.extend(reasm.push(packet).unwrap());
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame);
    }

    #[test]
    fn test_fragment_beyond_window_dropped() {
        let mut reasm = reassembler();

        // A late fragment arrives 200 sequence numbers behind the highest
        // fragment of its slot
        let late = make_packet(Bytes::from_static(&[0x7C, 0x80, 1, 2]), 100, 8000, false);
        let recent = make_packet(Bytes::from_static(&[0x7C, 0x00, 3, 4]), 300, 8000, false);

        assert!(reasm.push(recent).unwrap().is_empty());
        assert!(reasm.push(late).unwrap().is_empty());
        assert_eq!(reasm.dropped_fragments(), 1);

        // The slot can no longer complete; advancing the timestamp drops
        // the frame without partial delivery
        let next = make_packet(Bytes::from_static(&[0x7C, 0xC0, 5]), 301, 11_000, true);
        let frames = reasm.push(next).unwrap();

        assert_eq!(frames.len(), 1); // only the new single-unit frame
        assert_eq!(frames[0].timestamp, 11_000);
        assert_eq!(reasm.dropped_frames(), 1);
    }

    #[test]
    fn test_flush_on_advance_drops_incomplete() {
        let frame = Bytes::from(vec![0x41u8; 3 * 1400]);
        let fmt = FragmentingFormat::new(1400);
        let packets = fmt.packetize(frame).unwrap();

        let mut reasm = reassembler();
        // Deliver only the first two of three fragments
        reasm
            .push(make_packet(packets[0].data.clone(), 0, 1000, false))
            .unwrap();
        reasm
            .push(make_packet(packets[1].data.clone(), 1, 1000, false))
            .unwrap();

        // A newer timestamp flushes the incomplete slot
        let newer = make_packet(Bytes::from_static(&[0x7C, 0xC0, 9]), 3, 4000, true);
        let frames = reasm.push(newer).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 4000);
        assert_eq!(reasm.dropped_frames(), 1);
    }

    #[test]
    fn test_end_before_middle_completes_late() {
        let frame = Bytes::from(vec![0x41u8; 3 * 100]);
        let fmt = FragmentingFormat::new(100);
        let packets = fmt.packetize(frame.clone()).unwrap();
        assert_eq!(packets.len(), 3);

        let mut reasm = reassembler();
        // End fragment arrives before the middle one
        assert!(reasm
            .push(make_packet(packets[0].data.clone(), 10, 2000, false))
            .unwrap()
            .is_empty());
        assert!(reasm
            .push(make_packet(packets[2].data.clone(), 12, 2000, true))
            .unwrap()
            .is_empty());

        let frames = reasm
            .push(make_packet(packets[1].data.clone(), 11, 2000, false))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame);
    }

    #[test]
    fn test_start_arrives_after_middle() {
        // The slot's offset origin has to shift down when an earlier
        // sequence number shows up
        let frame = Bytes::from(vec![0x41u8; 3 * 100]);
        let fmt = FragmentingFormat::new(100);
        let packets = fmt.packetize(frame.clone()).unwrap();

        let mut reasm = reassembler();
        assert!(reasm
            .push(make_packet(packets[1].data.clone(), 11, 2000, false))
            .unwrap()
            .is_empty());
        assert!(reasm
            .push(make_packet(packets[0].data.clone(), 10, 2000, false))
            .unwrap()
            .is_empty());

        let frames = reasm
            .push(make_packet(packets[2].data.clone(), 12, 2000, true))
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame);
    }

    #[test]
    fn test_malformed_fragment_rejected() {
        let mut reasm = reassembler();

        let short = make_packet(Bytes::from_static(&[0x7C]), 1, 100, false);
        assert!(reasm.push(short).is_err());

        let wrong_type = make_packet(Bytes::from_static(&[0x61, 0x80, 0x00]), 2, 100, false);
        assert!(reasm.push(wrong_type).is_err());
    }

    #[test]
    fn test_timestamp_preserved_across_fragments() {
        let frame = Bytes::from(vec![0x65u8; 4000]);
        let fmt = FragmentingFormat::new(1400);
        let packets = fmt.packetize(frame).unwrap();

        let mut reasm = reassembler();
        let mut frames = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            frames.extend(
                reasm
                    .push(make_packet(p.data.clone(), i as u16, 0xCAFE_F00D, p.marker))
                    .unwrap(),
            );
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 0xCAFE_F00D);
    }
}
