//! Per-participant statistics and the shared participant table
//!
//! The receive worker mutates the table on every inbound RTP packet; the
//! RTCP runner takes the writer side while building report blocks and when
//! pruning timed-out members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::packet::rtcp::RtcpReportBlock;
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Counters for the local sending side, updated by the send worker and
/// read by the RTCP reporter
#[derive(Debug, Default)]
pub struct SenderStats {
    processed_packets: AtomicU64,
    processed_bytes: AtomicU64,
    overhead_bytes: AtomicU64,
    total_bytes: AtomicU64,
}

impl SenderStats {
    pub fn inc_processed_packets(&self, n: u64) {
        self.processed_packets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_processed_bytes(&self, n: u64) {
        self.processed_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_overhead_bytes(&self, n: u64) {
        self.overhead_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_total_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn processed_packets(&self) -> u64 {
        self.processed_packets.load(Ordering::Relaxed)
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes.load(Ordering::Relaxed)
    }

    pub fn overhead_bytes(&self) -> u64 {
        self.overhead_bytes.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

/// Byte and packet counters kept per remote SSRC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatBlock {
    /// Media payload octets delivered upward
    pub processed_bytes: u64,

    /// Header octets (datagram minus payload)
    pub overhead_bytes: u64,

    /// Total datagram octets
    pub total_bytes: u64,

    /// Packets accepted
    pub processed_packets: u64,

    /// Packets dropped (malformed, out of window, strict-order violations)
    pub dropped_packets: u64,
}

/// Per-remote-SSRC record
#[derive(Debug)]
pub struct Participant {
    /// Byte/packet counters
    pub stats: StatBlock,

    base_seq: RtpSequenceNumber,
    highest_seq: RtpSequenceNumber,

    /// Count of 16-bit sequence number wraps
    cycles: u32,

    received: u64,
    expected_prior: u64,
    received_prior: u64,

    /// RFC 3550 §A.8 interarrival jitter accumulator, in timestamp units
    jitter: f64,
    last_transit: Option<i64>,

    /// Middle 32 bits of the last SR's NTP timestamp and its arrival time
    last_sr: Option<(u32, Instant)>,

    /// Packet and octet counts announced by the last SR
    last_sr_counts: Option<(u32, u32)>,

    /// Last time anything (RTP or RTCP) arrived from this source
    last_heard: Instant,

    /// Last time an RTP packet arrived from this source
    last_rtp: Option<Instant>,

    /// Whether this participant currently counts as a sender
    is_sender: bool,
}

impl Participant {
    fn new(seq: RtpSequenceNumber, now: Instant) -> Self {
        Self {
            stats: StatBlock::default(),
            base_seq: seq,
            highest_seq: seq,
            cycles: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            last_transit: None,
            last_sr: None,
            last_sr_counts: None,
            last_heard: now,
            last_rtp: None,
            is_sender: false,
        }
    }

    /// Track the extended highest sequence number, counting wraps
    fn update_seq(&mut self, seq: RtpSequenceNumber) {
        let delta = seq.wrapping_sub(self.highest_seq);
        if delta < 0x8000 {
            if seq < self.highest_seq {
                self.cycles += 1;
            }
            self.highest_seq = seq;
        }
        // Older packets leave the extended highest untouched
    }

    /// Extended highest sequence number (wrap count in the high bits)
    pub fn extended_highest_seq(&self) -> u32 {
        (self.cycles << 16) | self.highest_seq as u32
    }

    fn expected(&self) -> u64 {
        let ext_base = self.base_seq as u64;
        let ext_highest = ((self.cycles as u64) << 16) | self.highest_seq as u64;
        ext_highest.wrapping_sub(ext_base) + 1
    }

    /// RFC 3550 §A.8: update the jitter estimate from the difference of
    /// relative transit times, both expressed in timestamp units
    fn update_jitter(&mut self, rtp_ts: RtpTimestamp, arrival_ts_units: i64) {
        let transit = arrival_ts_units - rtp_ts as i64;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Current jitter estimate in timestamp units
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Cumulative packets lost; duplicates can drive this negative
    pub fn cumulative_lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Build the report block for this participant, advancing the
    /// per-interval loss baseline
    fn build_report_block(&mut self, ssrc: RtpSsrc, now: Instant) -> RtcpReportBlock {
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            Some((mid, arrival)) => {
                let delay = now.duration_since(arrival).as_secs_f64();
                (mid, (delay * 65536.0) as u32)
            }
            None => (0, 0),
        };

        RtcpReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            highest_seq: self.extended_highest_seq(),
            jitter: self.jitter(),
            last_sr,
            delay_since_last_sr,
        }
    }
}

/// Shared table of remote participants, plus the membership counters the
/// RTCP scheduler works from
#[derive(Debug)]
pub struct ParticipantTable {
    map: RwLock<HashMap<RtpSsrc, Participant>>,

    /// Current member estimate, local participant included
    members: AtomicUsize,

    /// Current remote-sender estimate
    senders: AtomicUsize,
}

impl ParticipantTable {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            members: AtomicUsize::new(1),
            senders: AtomicUsize::new(0),
        }
    }

    /// Most current member estimate (local participant included)
    pub fn members(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    /// Most current remote-sender estimate
    pub fn senders(&self) -> usize {
        self.senders.load(Ordering::Relaxed)
    }

    /// Whether a participant with this SSRC is known
    pub fn contains(&self, ssrc: RtpSsrc) -> bool {
        self.map.read().unwrap().contains_key(&ssrc)
    }

    /// Ensure a stats block exists for a newly heard RTP sender
    pub fn check_sender(&self, ssrc: RtpSsrc, seq: RtpSequenceNumber) {
        let mut map = self.map.write().unwrap();
        let now = Instant::now();
        let participant = map.entry(ssrc).or_insert_with(|| {
            self.members.fetch_add(1, Ordering::Relaxed);
            debug!("New participant ssrc={:08x}", ssrc);
            Participant::new(seq, now)
        });
        if !participant.is_sender {
            participant.is_sender = true;
            self.senders.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pre-register a participant before any packet has been received
    pub fn add_participant(&self, ssrc: RtpSsrc) {
        let mut map = self.map.write().unwrap();
        if !map.contains_key(&ssrc) {
            map.insert(ssrc, Participant::new(0, Instant::now()));
            self.members.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one accepted RTP packet from `ssrc`
    pub fn record_rtp(
        &self,
        ssrc: RtpSsrc,
        seq: RtpSequenceNumber,
        payload_len: usize,
        datagram_len: usize,
        rtp_ts: RtpTimestamp,
        arrival_ts_units: i64,
    ) {
        self.check_sender(ssrc, seq);

        let mut map = self.map.write().unwrap();
        if let Some(p) = map.get_mut(&ssrc) {
            let now = Instant::now();
            p.received += 1;
            p.update_seq(seq);
            p.update_jitter(rtp_ts, arrival_ts_units);
            p.stats.processed_packets += 1;
            p.stats.processed_bytes += payload_len as u64;
            p.stats.overhead_bytes += (datagram_len - payload_len) as u64;
            p.stats.total_bytes += datagram_len as u64;
            p.last_heard = now;
            p.last_rtp = Some(now);
        }
    }

    /// Record a dropped packet attributed to `ssrc`
    pub fn record_dropped(&self, ssrc: RtpSsrc) {
        let mut map = self.map.write().unwrap();
        if let Some(p) = map.get_mut(&ssrc) {
            p.stats.dropped_packets += 1;
        }
    }

    /// Note a participant heard via RTCP (does not mark it a sender)
    pub fn note_member(&self, ssrc: RtpSsrc) {
        let mut map = self.map.write().unwrap();
        let now = Instant::now();
        match map.get_mut(&ssrc) {
            Some(p) => p.last_heard = now,
            None => {
                map.insert(ssrc, Participant::new(0, now));
                self.members.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record the arrival of a sender report from `ssrc`
    pub fn record_sr(&self, ssrc: RtpSsrc, ntp_mid: u32, packets: u32, octets: u32) {
        self.note_member(ssrc);
        let mut map = self.map.write().unwrap();
        if let Some(p) = map.get_mut(&ssrc) {
            p.last_sr = Some((ntp_mid, Instant::now()));
            p.last_sr_counts = Some((packets, octets));
        }
    }

    /// Packet and octet counts from the last SR heard from `ssrc`
    pub fn last_sr_counts(&self, ssrc: RtpSsrc) -> Option<(u32, u32)> {
        self.map.read().unwrap().get(&ssrc)?.last_sr_counts
    }

    /// Remove a participant (BYE); returns true when it was present
    pub fn remove(&self, ssrc: RtpSsrc) -> bool {
        let mut map = self.map.write().unwrap();
        match map.remove(&ssrc) {
            Some(p) => {
                self.members.fetch_sub(1, Ordering::Relaxed);
                if p.is_sender {
                    self.senders.fetch_sub(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Build report blocks for every known sender, advancing the loss
    /// baselines. At most 31 blocks fit one report.
    pub fn report_blocks(&self, now: Instant) -> Vec<RtcpReportBlock> {
        let mut map = self.map.write().unwrap();
        map.iter_mut()
            .filter(|(_, p)| p.received > 0)
            .take(31)
            .map(|(ssrc, p)| p.build_report_block(*ssrc, now))
            .collect()
    }

    /// Drop timed-out members and demote timed-out senders
    pub fn prune(&self, sender_timeout: Duration, member_timeout: Duration) {
        let now = Instant::now();
        let mut map = self.map.write().unwrap();

        let before = map.len();
        map.retain(|ssrc, p| {
            let keep = now.duration_since(p.last_heard) <= member_timeout;
            if !keep {
                debug!("Pruning silent participant ssrc={:08x}", ssrc);
                if p.is_sender {
                    self.senders.fetch_sub(1, Ordering::Relaxed);
                }
            }
            keep
        });
        let removed = before - map.len();
        if removed > 0 {
            self.members.fetch_sub(removed, Ordering::Relaxed);
        }

        for p in map.values_mut() {
            if p.is_sender {
                let rtp_stale = p
                    .last_rtp
                    .map_or(true, |t| now.duration_since(t) > sender_timeout);
                if rtp_stale {
                    p.is_sender = false;
                    self.senders.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Snapshot the stats block of one participant
    pub fn stats(&self, ssrc: RtpSsrc) -> Option<StatBlock> {
        self.map.read().unwrap().get(&ssrc).map(|p| p.stats)
    }
}

impl Default for ParticipantTable {
    fn default() -> Self {
        Self::new()
    }
}
