//! Application-visible media frames and push flags

use bytes::Bytes;

use crate::{RtpSsrc, RtpTimestamp};

/// No special handling for the pushed frame
pub const SEND_NONE: u32 = 0;

/// Do not advance the outgoing RTP timestamp after this frame.
///
/// Used when one logical media unit is pushed as several frames that must
/// share a single RTP timestamp.
pub const SEND_SAME_TIMESTAMP: u32 = 1 << 0;

/// One reassembled media frame delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Frame payload
    pub payload: Bytes,

    /// RTP timestamp shared by all packets of the frame
    pub timestamp: RtpTimestamp,

    /// Payload type from the RTP header
    pub payload_type: u8,

    /// SSRC of the sending participant
    pub ssrc: RtpSsrc,

    /// Marker bit of the final packet of the frame
    pub marker: bool,
}

impl MediaFrame {
    /// Length of the payload in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
