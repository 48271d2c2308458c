use bytes::{Buf, BufMut, BytesMut};

use crate::{Result, RtpSsrc};
use super::expect_remaining;

/// Report block in RTCP SR/RR packets, one per remote source
/// (RFC 3550 §6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReportBlock {
    /// SSRC identifier of the source this report is for
    pub ssrc: RtpSsrc,

    /// Fraction of packets lost since the last report, as a fixed-point
    /// number with the binary point at the left edge
    pub fraction_lost: u8,

    /// Cumulative number of packets lost; 24-bit signed on the wire, so
    /// duplicates can drive it below zero
    pub cumulative_lost: i32,

    /// Extended highest sequence number received (wrap count in the high
    /// 16 bits)
    pub highest_seq: u32,

    /// Interarrival jitter estimate in timestamp units
    pub jitter: u32,

    /// Middle 32 bits of the NTP timestamp of the last SR from this source
    pub last_sr: u32,

    /// Delay since that SR arrived, in units of 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl RtcpReportBlock {
    /// Size of a report block in bytes
    pub const SIZE: usize = 24;

    /// Create a new empty report block
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            fraction_lost: 0,
            cumulative_lost: 0,
            highest_seq: 0,
            jitter: 0,
            last_sr: 0,
            delay_since_last_sr: 0,
        }
    }

    /// Parse a report block from bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        expect_remaining(buf, Self::SIZE)?;

        let ssrc = buf.get_u32();

        // Fraction lost (8 bits) + cumulative lost (24 bits, sign-extended)
        let word = buf.get_u32();
        let fraction_lost = (word >> 24) as u8;
        let cumulative_lost = ((word << 8) as i32) >> 8;

        let highest_seq = buf.get_u32();
        let jitter = buf.get_u32();
        let last_sr = buf.get_u32();
        let delay_since_last_sr = buf.get_u32();

        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_seq,
            jitter,
            last_sr,
            delay_since_last_sr,
        })
    }

    /// Serialize a report block to bytes
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(Self::SIZE);

        buf.put_u32(self.ssrc);

        // Clamp the cumulative count into the 24-bit signed wire range
        let clamped = self.cumulative_lost.clamp(-(1 << 23), (1 << 23) - 1);
        let word = ((self.fraction_lost as u32) << 24) | (clamped as u32 & 0x00FF_FFFF);
        buf.put_u32(word);

        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);

        Ok(())
    }
}
