use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};
use super::expect_remaining;

/// RTCP Source Description (SDES) item types, RFC 3550 §6.5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpSdesItemType {
    /// End of SDES item list
    End = 0,

    /// Canonical name (CNAME)
    CName = 1,

    /// User name (NAME)
    Name = 2,

    /// E-mail address (EMAIL)
    Email = 3,

    /// Phone number (PHONE)
    Phone = 4,

    /// Geographic location (LOC)
    Location = 5,

    /// Application or tool name (TOOL)
    Tool = 6,

    /// Notice/status (NOTE)
    Note = 7,

    /// Private extensions (PRIV)
    Private = 8,
}

impl TryFrom<u8> for RtcpSdesItemType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RtcpSdesItemType::End),
            1 => Ok(RtcpSdesItemType::CName),
            2 => Ok(RtcpSdesItemType::Name),
            3 => Ok(RtcpSdesItemType::Email),
            4 => Ok(RtcpSdesItemType::Phone),
            5 => Ok(RtcpSdesItemType::Location),
            6 => Ok(RtcpSdesItemType::Tool),
            7 => Ok(RtcpSdesItemType::Note),
            8 => Ok(RtcpSdesItemType::Private),
            _ => Err(Error::InvalidPacket(format!(
                "Unknown SDES item type: {}",
                value
            ))),
        }
    }
}

/// One SDES item: a typed text value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSdesItem {
    /// Item type
    pub item_type: RtcpSdesItemType,

    /// Item value (UTF-8 text, at most 255 octets)
    pub value: String,
}

impl RtcpSdesItem {
    /// Convenience constructor for the mandatory CNAME item
    pub fn cname(value: impl Into<String>) -> Self {
        Self {
            item_type: RtcpSdesItemType::CName,
            value: value.into(),
        }
    }
}

/// One SDES chunk: an SSRC with its items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSdesChunk {
    /// SSRC/CSRC identifier this chunk describes
    pub ssrc: RtpSsrc,

    /// SDES items
    pub items: Vec<RtcpSdesItem>,
}

/// RTCP Source Description (SDES) packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSourceDescription {
    /// SDES chunks
    pub chunks: Vec<RtcpSdesChunk>,
}

impl RtcpSourceDescription {
    /// Create an SDES packet carrying a single CNAME chunk
    pub fn cname(ssrc: RtpSsrc, cname: impl Into<String>) -> Self {
        Self {
            chunks: vec![RtcpSdesChunk {
                ssrc,
                items: vec![RtcpSdesItem::cname(cname)],
            }],
        }
    }

    /// Serialize the packet body. Each chunk ends with an END octet and is
    /// padded to a 32-bit boundary.
    pub fn serialize(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();

        for chunk in &self.chunks {
            buf.put_u32(chunk.ssrc);

            let mut chunk_len = 4;
            for item in &chunk.items {
                let text = item.value.as_bytes();
                if text.len() > 255 {
                    return Err(Error::InvalidValue(format!(
                        "SDES item of {} octets exceeds the 255-octet limit",
                        text.len()
                    )));
                }
                buf.put_u8(item.item_type as u8);
                buf.put_u8(text.len() as u8);
                buf.put_slice(text);
                chunk_len += 2 + text.len();
            }

            // END octet, then pad the chunk to a word boundary
            buf.put_u8(RtcpSdesItemType::End as u8);
            chunk_len += 1;
            while chunk_len % 4 != 0 {
                buf.put_u8(0);
                chunk_len += 1;
            }
        }

        Ok(buf)
    }
}

/// Parse an SDES packet body
pub(super) fn parse(buf: &mut impl Buf, chunk_count: u8) -> Result<RtcpSourceDescription> {
    let mut chunks = Vec::with_capacity(chunk_count as usize);

    for _ in 0..chunk_count {
        expect_remaining(buf, 4)?;
        let ssrc = buf.get_u32();

        let mut items = Vec::new();
        let mut consumed = 4usize;

        loop {
            expect_remaining(buf, 1)?;
            let raw_type = buf.get_u8();
            consumed += 1;

            if raw_type == RtcpSdesItemType::End as u8 {
                break;
            }

            let item_type = RtcpSdesItemType::try_from(raw_type)?;
            expect_remaining(buf, 1)?;
            let len = buf.get_u8() as usize;
            consumed += 1;

            expect_remaining(buf, len)?;
            let text = buf.copy_to_bytes(len);
            consumed += len;

            items.push(RtcpSdesItem {
                item_type,
                value: String::from_utf8_lossy(&text).into_owned(),
            });
        }

        // Skip padding up to the next word boundary
        while consumed % 4 != 0 {
            expect_remaining(buf, 1)?;
            buf.get_u8();
            consumed += 1;
        }

        chunks.push(RtcpSdesChunk { ssrc, items });
    }

    Ok(RtcpSourceDescription { chunks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdes_cname_roundtrip() {
        let original = RtcpSourceDescription::cname(0x12345678, "host@example.net");

        let serialized = original.serialize().unwrap();
        assert_eq!(serialized.len() % 4, 0);

        let parsed = parse(&mut serialized.freeze(), 1).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_sdes_multiple_items() {
        let original = RtcpSourceDescription {
            chunks: vec![RtcpSdesChunk {
                ssrc: 0xcafebabe,
                items: vec![
                    RtcpSdesItem::cname("a@b"),
                    RtcpSdesItem {
                        item_type: RtcpSdesItemType::Tool,
                        value: "rtp-stream".to_string(),
                    },
                ],
            }],
        };

        let serialized = original.serialize().unwrap();
        let parsed = parse(&mut serialized.freeze(), 1).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_sdes_item_too_long_rejected() {
        let original = RtcpSourceDescription::cname(1, "x".repeat(300));
        assert!(original.serialize().is_err());
    }
}
