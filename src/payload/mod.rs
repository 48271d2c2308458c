//! Payload formatters and depacketizers
//!
//! Two payload disciplines are supported: opaque (one frame, one packet)
//! and fragmenting (NAL-style fragmentation units for frames that exceed
//! the MTU ceiling). The formatter for a stream is selected once at `init`
//! from the stream configuration; each discipline carries its own
//! per-stream reassembly state on the receive side.

mod fragment;
mod opaque;

pub use fragment::{FragmentReassembler, FragmentingFormat, FRAGMENT_UNIT_TYPE};
pub use opaque::{OpaqueDepacketizer, OpaqueFormat};

use bytes::Bytes;
use std::time::Duration;

use crate::context::{CtxFlag, MediaConfig, StreamConfig};
use crate::frame::MediaFrame;
use crate::packet::RtpPacket;
use crate::Result;

/// One packet-sized payload produced by a formatter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketizedPayload {
    /// Payload bytes, prefix included where the discipline uses one
    pub data: Bytes,

    /// Whether the RTP marker bit is set on this packet
    pub marker: bool,
}

/// Payload formatter variants, closed set
#[derive(Debug, Clone)]
pub enum PayloadFormat {
    /// One frame maps to one packet
    Opaque(OpaqueFormat),

    /// Oversize frames split into fragmentation units
    Fragmenting(FragmentingFormat),
}

impl PayloadFormat {
    /// Select the formatter for a stream from its configuration
    pub fn from_config(config: &StreamConfig, media: &MediaConfig) -> Self {
        if config.has_flag(CtxFlag::FragmentingPayload) {
            PayloadFormat::Fragmenting(FragmentingFormat::new(media.fragment_size))
        } else {
            PayloadFormat::Opaque(OpaqueFormat::new(media.fragment_size))
        }
    }

    /// Split one application frame into packet payloads
    pub fn packetize(&self, frame: Bytes) -> Result<Vec<PacketizedPayload>> {
        match self {
            PayloadFormat::Opaque(fmt) => fmt.packetize(frame),
            PayloadFormat::Fragmenting(fmt) => fmt.packetize(frame),
        }
    }

    /// Build the matching depacketizer with its reassembly state
    pub fn depacketizer(&self, reorder_window: u16, retention: Duration) -> Depacketizer {
        match self {
            PayloadFormat::Opaque(_) => Depacketizer::Opaque(OpaqueDepacketizer::new()),
            PayloadFormat::Fragmenting(_) => {
                Depacketizer::Fragmenting(FragmentReassembler::new(reorder_window, retention))
            }
        }
    }
}

/// Depacketizer variants, matching [`PayloadFormat`]
#[derive(Debug)]
pub enum Depacketizer {
    /// Every packet is a complete frame
    Opaque(OpaqueDepacketizer),

    /// Fragments are collected into reassembly slots keyed by timestamp
    Fragmenting(FragmentReassembler),
}

impl Depacketizer {
    /// Feed one parsed RTP packet; returns any frames completed by it
    pub fn push(&mut self, packet: RtpPacket) -> Result<Vec<MediaFrame>> {
        match self {
            Depacketizer::Opaque(d) => d.push(packet),
            Depacketizer::Fragmenting(d) => d.push(packet),
        }
    }

    /// Frames dropped by the depacketizer (incomplete or out of window)
    pub fn dropped_frames(&self) -> u64 {
        match self {
            Depacketizer::Opaque(_) => 0,
            Depacketizer::Fragmenting(d) => d.dropped_frames(),
        }
    }
}
