//! RTP packet module
//!
//! Structures for handling RTP packets as defined in RFC 3550, plus the
//! RTCP packet types in the `rtcp` submodule.

pub mod rtcp;
pub mod rtp;

pub use rtp::{RtpExtension, RtpHeader, RtpPacket, RTP_MIN_HEADER_SIZE, RTP_VERSION};

/// Render a byte slice as space-separated hex for debug logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_rtp_packet_creation() {
        let payload = Bytes::from_static(b"test payload");
        let packet = RtpPacket::new_with_payload(96, 1000, 12345, 0xabcdef01, payload.clone());

        assert_eq!(packet.header.payload_type, 96);
        assert_eq!(packet.header.sequence_number, 1000);
        assert_eq!(packet.header.timestamp, 12345);
        assert_eq!(packet.header.ssrc, 0xabcdef01);
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_packet_serialize_parse_roundtrip() {
        let payload = Bytes::from_static(b"test payload data");
        let original = RtpPacket::new_with_payload(96, 1000, 12345, 0xabcdef01, payload);

        let serialized = original.serialize().unwrap();
        let parsed = RtpPacket::parse(&serialized).unwrap();

        assert_eq!(parsed.header.payload_type, original.header.payload_type);
        assert_eq!(parsed.header.sequence_number, original.header.sequence_number);
        assert_eq!(parsed.header.timestamp, original.header.timestamp);
        assert_eq!(parsed.header.ssrc, original.header.ssrc);
        assert_eq!(parsed.payload, original.payload);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x80, 0x60, 0x00]), "80 60 00");
    }
}
