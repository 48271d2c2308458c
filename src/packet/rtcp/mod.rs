//! RTCP packet module
//!
//! Structures for handling RTCP packets as defined in RFC 3550 §6: Sender
//! Report, Receiver Report, Source Description, BYE and APP, plus compound
//! packet framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::Result;

mod app;
mod bye;
mod ntp;
mod receiver_report;
mod report_block;
mod sdes;
mod sender_report;

pub use app::RtcpApp;
pub use bye::RtcpGoodbye;
pub use ntp::NtpTimestamp;
pub use receiver_report::RtcpReceiverReport;
pub use report_block::RtcpReportBlock;
pub use sdes::{RtcpSdesChunk, RtcpSdesItem, RtcpSdesItemType, RtcpSourceDescription};
pub use sender_report::RtcpSenderReport;

/// RTCP version (same as RTP, always 2)
pub const RTCP_VERSION: u8 = 2;

/// Size of the common RTCP packet header in bytes
pub const RTCP_HEADER_SIZE: usize = 4;

/// RTCP packet types as defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report (SR)
    SenderReport = 200,

    /// Receiver Report (RR)
    ReceiverReport = 201,

    /// Source Description (SDES)
    SourceDescription = 202,

    /// Goodbye (BYE)
    Goodbye = 203,

    /// Application-Defined (APP)
    App = 204,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            200 => Ok(RtcpPacketType::SenderReport),
            201 => Ok(RtcpPacketType::ReceiverReport),
            202 => Ok(RtcpPacketType::SourceDescription),
            203 => Ok(RtcpPacketType::Goodbye),
            204 => Ok(RtcpPacketType::App),
            _ => Err(Error::InvalidPacket(format!(
                "Unknown RTCP packet type: {}",
                value
            ))),
        }
    }
}

/// RTCP packet variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender Report (SR)
    SenderReport(RtcpSenderReport),

    /// Receiver Report (RR)
    ReceiverReport(RtcpReceiverReport),

    /// Source Description (SDES)
    SourceDescription(RtcpSourceDescription),

    /// Goodbye (BYE)
    Goodbye(RtcpGoodbye),

    /// Application-Defined (APP)
    App(RtcpApp),
}

impl RtcpPacket {
    /// Parse one RTCP packet from the front of `data`, returning the packet
    /// and the number of bytes it occupied on the wire.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RTCP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTCP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != RTCP_VERSION {
            return Err(Error::InvalidPacket(format!(
                "Invalid RTCP version: {}",
                version
            )));
        }

        let _padding = (first_byte >> 5) & 0x01 != 0;
        let count = first_byte & 0x1F;
        let packet_type = RtcpPacketType::try_from(data[1])?;

        // Length is in 32-bit words minus one
        let length = u16::from_be_bytes([data[2], data[3]]) as usize * 4;
        let total = RTCP_HEADER_SIZE + length;

        if data.len() < total {
            return Err(Error::BufferTooSmall {
                required: total,
                available: data.len(),
            });
        }

        let mut body = Bytes::copy_from_slice(&data[RTCP_HEADER_SIZE..total]);

        let packet = match packet_type {
            RtcpPacketType::SenderReport => {
                RtcpPacket::SenderReport(sender_report::parse(&mut body, count)?)
            }
            RtcpPacketType::ReceiverReport => {
                RtcpPacket::ReceiverReport(receiver_report::parse(&mut body, count)?)
            }
            RtcpPacketType::SourceDescription => {
                RtcpPacket::SourceDescription(sdes::parse(&mut body, count)?)
            }
            RtcpPacketType::Goodbye => RtcpPacket::Goodbye(bye::parse(&mut body, count)?),
            RtcpPacketType::App => {
                let mut app = app::parse(&mut body)?;
                app.subtype = count;
                RtcpPacket::App(app)
            }
        };

        Ok((packet, total))
    }

    /// Parse a compound RTCP packet: one or more packets back to back
    pub fn parse_compound(data: &[u8]) -> Result<Vec<Self>> {
        let mut packets = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let (packet, consumed) = Self::parse(&data[offset..])?;
            packets.push(packet);
            offset += consumed;
        }

        if packets.is_empty() {
            return Err(Error::InvalidPacket("Empty RTCP compound packet".to_string()));
        }

        Ok(packets)
    }

    /// The packet type of this variant
    pub fn packet_type(&self) -> RtcpPacketType {
        match self {
            RtcpPacket::SenderReport(_) => RtcpPacketType::SenderReport,
            RtcpPacket::ReceiverReport(_) => RtcpPacketType::ReceiverReport,
            RtcpPacket::SourceDescription(_) => RtcpPacketType::SourceDescription,
            RtcpPacket::Goodbye(_) => RtcpPacketType::Goodbye,
            RtcpPacket::App(_) => RtcpPacketType::App,
        }
    }

    /// Serialize the packet, including the common header
    pub fn serialize(&self) -> Result<Bytes> {
        let (count, body) = match self {
            RtcpPacket::SenderReport(sr) => (sr.report_blocks.len() as u8, sr.serialize()?),
            RtcpPacket::ReceiverReport(rr) => (rr.report_blocks.len() as u8, rr.serialize()?),
            RtcpPacket::SourceDescription(sdes) => (sdes.chunks.len() as u8, sdes.serialize()?),
            RtcpPacket::Goodbye(bye) => (bye.sources.len() as u8, bye.serialize()?),
            RtcpPacket::App(app) => (app.subtype & 0x1F, app.serialize()?),
        };

        if count > 0x1F {
            return Err(Error::InvalidValue(format!(
                "RTCP item count {} exceeds 5-bit field",
                count
            )));
        }
        if body.len() % 4 != 0 {
            return Err(Error::InvalidPacket(format!(
                "RTCP body length {} is not 32-bit aligned",
                body.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(RTCP_HEADER_SIZE + body.len());
        buf.put_u8((RTCP_VERSION << 6) | count);
        buf.put_u8(self.packet_type() as u8);
        buf.put_u16((body.len() / 4) as u16);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Serialize a compound packet by concatenation
    pub fn serialize_compound(packets: &[RtcpPacket]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        for packet in packets {
            buf.put_slice(&packet.serialize()?);
        }
        Ok(buf.freeze())
    }
}

/// Require `len` readable bytes or fail with `BufferTooSmall`
pub(crate) fn expect_remaining(buf: &impl Buf, len: usize) -> Result<()> {
    if buf.remaining() < len {
        Err(Error::BufferTooSmall {
            required: len,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}
