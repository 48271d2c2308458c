//! Opaque payload discipline: one media frame maps to one RTP packet

use bytes::Bytes;

use crate::error::Error;
use crate::frame::MediaFrame;
use crate::packet::RtpPacket;
use crate::Result;

use super::PacketizedPayload;

/// Formatter for payloads that always fit in a single packet
#[derive(Debug, Clone)]
pub struct OpaqueFormat {
    /// Largest payload accepted, normally the MTU ceiling
    max_payload: usize,
}

impl OpaqueFormat {
    /// Create an opaque formatter with the given payload ceiling
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// One frame in, one marked packet payload out
    pub fn packetize(&self, frame: Bytes) -> Result<Vec<PacketizedPayload>> {
        if frame.is_empty() {
            return Err(Error::InvalidValue("empty frame".to_string()));
        }
        if frame.len() > self.max_payload {
            return Err(Error::PayloadTooBig {
                size: frame.len(),
                limit: self.max_payload,
            });
        }

        Ok(vec![PacketizedPayload {
            data: frame,
            marker: true,
        }])
    }
}

/// Depacketizer counterpart: every packet is delivered as a frame
#[derive(Debug, Default)]
pub struct OpaqueDepacketizer;

impl OpaqueDepacketizer {
    pub fn new() -> Self {
        Self
    }

    pub fn push(&mut self, packet: RtpPacket) -> Result<Vec<MediaFrame>> {
        Ok(vec![MediaFrame {
            payload: packet.payload,
            timestamp: packet.header.timestamp,
            payload_type: packet.header.payload_type,
            ssrc: packet.header.ssrc,
            marker: packet.header.marker,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_single_packet() {
        let fmt = OpaqueFormat::new(1400);
        let packets = fmt.packetize(Bytes::from(vec![7u8; 800])).unwrap();

        assert_eq!(packets.len(), 1);
        assert!(packets[0].marker);
        assert_eq!(packets[0].data.len(), 800);
    }

    #[test]
    fn test_opaque_rejects_oversize() {
        let fmt = OpaqueFormat::new(1400);
        let err = fmt.packetize(Bytes::from(vec![0u8; 1401]));
        assert!(matches!(err, Err(Error::PayloadTooBig { size: 1401, limit: 1400 })));
    }

    #[test]
    fn test_opaque_rejects_empty() {
        let fmt = OpaqueFormat::new(1400);
        assert!(matches!(
            fmt.packetize(Bytes::new()),
            Err(Error::InvalidValue(_))
        ));
    }

    #[test]
    fn test_opaque_depacketize() {
        let mut depack = OpaqueDepacketizer::new();
        let packet = RtpPacket::new_with_payload(96, 1, 9000, 0xfeed, Bytes::from_static(b"frame"));

        let frames = depack.push(packet).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.as_ref(), b"frame");
        assert_eq!(frames[0].timestamp, 9000);
    }
}
