//! Real-time media transport over unreliable datagrams
//!
//! This crate transports application media frames over UDP using the RTP
//! protocol family: RTP for payload, RTCP for periodic control feedback and
//! ZRTP for in-band key agreement. It exposes a media-stream abstraction
//! that packetizes frames into wire packets, transmits them to a remote
//! endpoint, reassembles counterpart packets and runs the RTCP report loop
//! out of band.
//!
//! The library is organized into several modules:
//!
//! - `packet`: RTP and RTCP packet definitions and processing
//! - `payload`: payload formatters (opaque and fragmenting) and reassembly
//! - `session`: media stream management (sender, receiver, lifecycle)
//! - `rtcp`: the periodic RTCP reporter with membership tracking
//! - `transport`: datagram transport for RTP/RTCP
//! - `zrtp`: ZRTP key agreement state machine
//! - `srtp`: SRTP key material produced by ZRTP
//! - `context`: process-wide factory and stream configuration

mod error;

// Main modules
pub mod context;
pub mod frame;
pub mod packet;
pub mod payload;
pub mod rtcp;
pub mod session;
pub mod srtp;
pub mod transport;
pub mod zrtp;

// Re-export core types
pub use error::Error;

pub use context::{CtxFlag, CtxParameter, MediaConfig, RtpContext, StreamConfig};
pub use frame::MediaFrame;
pub use packet::{RtpHeader, RtpPacket};
pub use packet::rtcp::{
    NtpTimestamp, RtcpApp, RtcpGoodbye, RtcpPacket, RtcpReceiverReport,
    RtcpReportBlock, RtcpSenderReport, RtcpSourceDescription,
};
pub use session::{MediaStream, RtpSession};

/// The default maximum size for RTP datagrams in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Default ceiling for a single fragment's media payload in bytes
pub const DEFAULT_FRAGMENT_SIZE: usize = 1400;

/// Default reorder window for fragment reassembly, in sequence numbers
pub const DEFAULT_REORDER_WINDOW: u16 = 128;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Typedef for RTP contributing source identifier
pub type RtpCsrc = u32;

/// Result type for media stream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        CtxFlag, CtxParameter, Error, MediaConfig, MediaFrame, MediaStream,
        Result, RtpContext, RtpHeader, RtpPacket, RtpSequenceNumber, RtpSession,
        RtpSsrc, RtpTimestamp, StreamConfig,
    };

    pub use crate::packet::rtcp::{
        NtpTimestamp, RtcpPacket, RtcpReceiverReport, RtcpReportBlock,
        RtcpSenderReport,
    };
}
