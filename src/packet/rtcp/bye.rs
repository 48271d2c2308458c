use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};
use super::expect_remaining;

/// RTCP Goodbye (BYE) packet, RFC 3550 §6.6
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpGoodbye {
    /// SSRC/CSRC identifiers leaving the session
    pub sources: Vec<RtpSsrc>,

    /// Reason for leaving (optional)
    pub reason: Option<String>,
}

impl RtcpGoodbye {
    /// Create a BYE for a single source
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    /// Attach a leave reason
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Serialize the packet body, padding the reason to a word boundary
    pub fn serialize(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();

        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }

        if let Some(reason) = &self.reason {
            let text = reason.as_bytes();
            if text.len() > 255 {
                return Err(Error::InvalidValue(format!(
                    "BYE reason of {} octets exceeds the 255-octet limit",
                    text.len()
                )));
            }

            buf.put_u8(text.len() as u8);
            buf.put_slice(text);

            let mut len = 1 + text.len();
            while len % 4 != 0 {
                buf.put_u8(0);
                len += 1;
            }
        }

        Ok(buf)
    }
}

/// Parse a BYE packet body
pub(super) fn parse(buf: &mut impl Buf, source_count: u8) -> Result<RtcpGoodbye> {
    let mut sources = Vec::with_capacity(source_count as usize);
    for _ in 0..source_count {
        expect_remaining(buf, 4)?;
        sources.push(buf.get_u32());
    }

    let reason = if buf.has_remaining() {
        let len = buf.get_u8() as usize;
        expect_remaining(buf, len)?;
        let text = buf.copy_to_bytes(len);
        Some(String::from_utf8_lossy(&text).into_owned())
    } else {
        None
    };

    Ok(RtcpGoodbye { sources, reason })
}
