use bytes::{Buf, BufMut, BytesMut};

use crate::{Result, RtpSsrc};
use super::expect_remaining;
use super::report_block::RtcpReportBlock;

/// RTCP Receiver Report (RR) packet, RFC 3550 §6.4.2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReceiverReport {
    /// SSRC of the receiver issuing this report
    pub ssrc: RtpSsrc,

    /// Report blocks, one per remote source
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpReceiverReport {
    /// Create a new receiver report
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            report_blocks: Vec::new(),
        }
    }

    /// Add a report block
    pub fn add_report_block(&mut self, block: RtcpReportBlock) {
        self.report_blocks.push(block);
    }

    /// Body size in bytes (excluding the common header)
    pub fn size(&self) -> usize {
        4 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Serialize the report body
    pub fn serialize(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(self.size());

        buf.put_u32(self.ssrc);
        for block in &self.report_blocks {
            block.serialize(&mut buf)?;
        }

        Ok(buf)
    }
}

/// Parse a receiver report body
pub(super) fn parse(buf: &mut impl Buf, report_count: u8) -> Result<RtcpReceiverReport> {
    expect_remaining(buf, 4)?;

    let ssrc = buf.get_u32();

    let mut report_blocks = Vec::with_capacity(report_count as usize);
    for _ in 0..report_count {
        report_blocks.push(RtcpReportBlock::parse(buf)?);
    }

    Ok(RtcpReceiverReport { ssrc, report_blocks })
}
