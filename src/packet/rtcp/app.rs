use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};
use super::expect_remaining;

/// RTCP Application-Defined (APP) packet, RFC 3550 §6.7
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpApp {
    /// Application-defined subtype (carried in the count field)
    pub subtype: u8,

    /// SSRC/CSRC identifier
    pub ssrc: RtpSsrc,

    /// Name (4 ASCII characters)
    pub name: [u8; 4],

    /// Application-dependent data, a multiple of 4 octets on the wire
    pub data: Bytes,
}

impl RtcpApp {
    /// Create a new APP packet
    pub fn new(subtype: u8, ssrc: RtpSsrc, name: [u8; 4], data: Bytes) -> Self {
        Self {
            subtype,
            ssrc,
            name,
            data,
        }
    }

    /// Serialize the packet body, padding the data to a word boundary
    pub fn serialize(&self) -> Result<BytesMut> {
        if self.subtype > 0x1F {
            return Err(Error::InvalidValue(format!(
                "APP subtype {} exceeds 5-bit field",
                self.subtype
            )));
        }

        let mut buf = BytesMut::with_capacity(8 + self.data.len() + 3);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);

        while buf.len() % 4 != 0 {
            buf.put_u8(0);
        }

        Ok(buf)
    }
}

/// Parse an APP packet body (the subtype arrives via the common header)
pub(super) fn parse(buf: &mut impl Buf) -> Result<RtcpApp> {
    expect_remaining(buf, 8)?;

    let ssrc = buf.get_u32();
    let mut name = [0u8; 4];
    buf.copy_to_slice(&mut name);
    let data = buf.copy_to_bytes(buf.remaining());

    Ok(RtcpApp {
        subtype: 0,
        ssrc,
        name,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_roundtrip() {
        let original = RtcpApp::new(3, 0x12345678, *b"QUAL", Bytes::from_static(b"12345678"));

        let serialized = original.serialize().unwrap();
        assert_eq!(serialized.len() % 4, 0);

        let mut parsed = parse(&mut serialized.freeze()).unwrap();
        parsed.subtype = 3; // restored from the common header by the caller

        assert_eq!(parsed, original);
    }

    #[test]
    fn test_app_subtype_range_checked() {
        let app = RtcpApp::new(40, 1, *b"TEST", Bytes::new());
        assert!(app.serialize().is_err());
    }
}
