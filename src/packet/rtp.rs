//! RTP header and packet processing per RFC 3550 §5

use bitvec::prelude::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Header extension as parsed from the wire. The extension is carried but
/// not interpreted; translator and mixer roles are out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    /// Profile-defined extension identifier
    pub id: u16,

    /// Extension payload, padded to a 32-bit boundary on the wire
    pub data: Bytes,
}

/// RTP header implementation according to RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// CSRC count (number of contributing sources)
    pub cc: u8,

    /// Marker bit
    pub marker: bool,

    /// Payload type
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Contributing source identifiers
    pub csrc: Vec<RtpCsrc>,

    /// Header extension, if present
    pub extension: Option<RtpExtension>,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            cc: 0,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extension: None,
        }
    }
}

impl RtpHeader {
    /// Create a new RTP header with default values
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        }
    }

    /// Get the size of the header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;

        if let Some(ext) = &self.extension {
            // 4 bytes of extension header plus data padded to 32 bits
            size += 4 + (ext.data.len() + 3) / 4 * 4;
        }

        size
    }

    /// Parse an RTP header from bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // First byte: version (2 bits), padding (1 bit), extension (1 bit),
        // CSRC count (4 bits)
        let first_byte = buf.get_u8();
        let bits = first_byte.view_bits::<Msb0>();

        let version = bits[0..2].load::<u8>();
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!(
                "Invalid RTP version: {}",
                version
            )));
        }

        let padding = bits[2];
        let has_extension = bits[3];
        let cc = bits[4..8].load::<u8>();

        // Second byte: marker (1 bit), payload type (7 bits)
        let second_byte = buf.get_u8();
        let marker = second_byte & 0x80 != 0;
        let payload_type = second_byte & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut csrc = Vec::with_capacity(cc as usize);
        for _ in 0..cc {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            csrc.push(buf.get_u32());
        }

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }

            let id = buf.get_u16();
            let length = buf.get_u16() as usize * 4; // length in 32-bit words

            if buf.remaining() < length {
                return Err(Error::BufferTooSmall {
                    required: length,
                    available: buf.remaining(),
                });
            }

            Some(RtpExtension {
                id,
                data: buf.copy_to_bytes(length),
            })
        } else {
            None
        };

        Ok(Self {
            version,
            padding,
            cc,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.cc as usize != self.csrc.len() {
            return Err(Error::InvalidValue(format!(
                "CSRC count ({}) does not match CSRC list length ({})",
                self.cc,
                self.csrc.len()
            )));
        }

        buf.reserve(self.size());

        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 1 << 5;
        }
        if self.extension.is_some() {
            first_byte |= 1 << 4;
        }
        first_byte |= self.cc & 0x0F;
        buf.put_u8(first_byte);

        let mut second_byte = self.payload_type & 0x7F;
        if self.marker {
            second_byte |= 1 << 7;
        }
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if let Some(ext) = &self.extension {
            buf.put_u16(ext.id);
            buf.put_u16(((ext.data.len() + 3) / 4) as u16);
            buf.put_slice(&ext.data);

            let pad = (4 - ext.data.len() % 4) % 4;
            for _ in 0..pad {
                buf.put_u8(0);
            }
        }

        Ok(())
    }
}

/// RTP packet: header plus payload
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,

    /// Payload data
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new RTP packet
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a new RTP packet with basic parameters
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        Self {
            header: RtpHeader::new(payload_type, sequence_number, timestamp, ssrc),
            payload,
        }
    }

    /// Get the total size of the packet in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Parse an RTP packet from a datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let header = RtpHeader::parse(&mut buf)?;

        // The last padding octet counts the padding, itself included
        let padding_len = if header.padding && !buf.is_empty() {
            let count = *buf.last().unwrap_or(&0) as usize;
            if count == 0 || count > buf.len() {
                return Err(Error::InvalidPacket(format!(
                    "Invalid padding count {} with {} bytes remaining",
                    count,
                    buf.len()
                )));
            }
            count
        } else {
            0
        };

        let payload = buf.slice(0..buf.len() - padding_len);

        Ok(Self { header, payload })
    }

    /// Serialize the packet into a datagram
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

// The payload can be large; keep Debug output to the header and a length.
impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let original = RtpHeader::new(96, 4711, 0x12345678, 0xabcdef01);

        let mut buf = BytesMut::with_capacity(RTP_MIN_HEADER_SIZE);
        original.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), RTP_MIN_HEADER_SIZE);

        let mut reader = buf.freeze();
        let parsed = RtpHeader::parse(&mut reader).unwrap();

        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.sequence_number, 4711);
        assert_eq!(parsed.timestamp, 0x12345678);
        assert_eq!(parsed.ssrc, 0xabcdef01);
        assert!(!parsed.marker);
        assert_eq!(parsed.cc, 0);
    }

    #[test]
    fn test_header_with_csrc() {
        let mut header = RtpHeader::new(96, 1000, 0x12345678, 0xabcdef01);
        header.csrc = vec![0x11111111, 0x22222222];
        header.cc = 2;

        let mut buf = BytesMut::new();
        header.serialize(&mut buf).unwrap();

        let mut reader = buf.freeze();
        let parsed = RtpHeader::parse(&mut reader).unwrap();

        assert_eq!(parsed.cc, 2);
        assert_eq!(parsed.csrc, vec![0x11111111, 0x22222222]);
    }

    #[test]
    fn test_header_csrc_mismatch_rejected() {
        let mut header = RtpHeader::new(96, 1000, 0, 0);
        header.cc = 1; // no matching csrc entry

        let mut buf = BytesMut::new();
        assert!(header.serialize(&mut buf).is_err());
    }

    #[test]
    fn test_header_with_extension() {
        let mut header = RtpHeader::new(96, 1000, 0x12345678, 0xabcdef01);
        header.extension = Some(RtpExtension {
            id: 0x1234,
            data: Bytes::from_static(b"extension data"),
        });

        let mut buf = BytesMut::new();
        header.serialize(&mut buf).unwrap();

        // Extension bit must be set in the first byte
        assert_eq!((buf[0] >> 4) & 0x01, 1);

        let mut reader = buf.freeze();
        let parsed = RtpHeader::parse(&mut reader).unwrap();

        let ext = parsed.extension.expect("extension missing after parse");
        assert_eq!(ext.id, 0x1234);
        // Wire data is padded to a 32-bit boundary
        assert!(ext.data.starts_with(b"extension data"));
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        // First byte 0x40 encodes version 1
        let data = [
            0x40, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
        ];
        let mut buf = Bytes::copy_from_slice(&data);
        assert!(matches!(
            RtpHeader::parse(&mut buf),
            Err(Error::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let data = [0x80, 0x60, 0x00];
        let mut buf = Bytes::copy_from_slice(&data);
        assert!(matches!(
            RtpHeader::parse(&mut buf),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_csrc_overrun() {
        // cc = 2 but no CSRC words follow the fixed header
        let data = [
            0x82, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
        ];
        let mut buf = Bytes::copy_from_slice(&data);
        assert!(RtpHeader::parse(&mut buf).is_err());
    }

    #[test]
    fn test_packet_with_padding() {
        // 12-byte header with P bit, 4-byte payload, 4 padding bytes
        let mut data = vec![
            0xA0, 0x00, 0xfd, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        data.extend_from_slice(b"Test");
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x04]);

        let parsed = RtpPacket::parse(&data).unwrap();
        assert_eq!(parsed.payload.as_ref(), b"Test");
    }

    #[test]
    fn test_parse_real_world_packet() {
        // Version 2, no padding, PT 0 (PCMU), seq 0xfd70
        let packet_data = [
            0x80, 0x00, 0xfd, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x54, 0x65, 0x73, 0x74,
        ];

        let parsed = RtpPacket::parse(&packet_data).unwrap();

        assert_eq!(parsed.header.version, 2);
        assert_eq!(parsed.header.payload_type, 0);
        assert_eq!(parsed.header.cc, 0);
        assert_eq!(parsed.header.sequence_number, 0xfd70);
        assert_eq!(parsed.payload.as_ref(), b"Test");
    }
}
