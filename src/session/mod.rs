//! RTP session management
//!
//! A session is identified by its SSRC and issues media streams toward a
//! single remote address. Each stream owns a socket, a sender and a
//! receiver, plus the optional RTCP reporter and ZRTP negotiation.

mod receiver;
mod sender;
mod stream;

pub use stream::MediaStream;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;

use crate::context::StreamConfig;
use crate::frame::MediaFrame;
use crate::RtpSsrc;

/// Callback invoked once per reassembled frame on the receive worker.
/// Hooks must not block.
pub type ReceiveHook = Arc<dyn Fn(MediaFrame) + Send + Sync>;

/// Callback invoked once per pushed frame after its last fragment has
/// left the socket
pub type DeallocHook = Arc<dyn Fn(Bytes) + Send + Sync>;

/// One RTP session toward a single remote address
pub struct RtpSession {
    remote_addr: IpAddr,
    config: StreamConfig,
    cname: String,
    ssrc: Arc<AtomicU32>,
}

impl RtpSession {
    pub(crate) fn new(remote_addr: IpAddr, config: StreamConfig, cname: String) -> Self {
        Self {
            remote_addr,
            config,
            cname,
            ssrc: Arc::new(AtomicU32::new(rand::thread_rng().gen())),
        }
    }

    /// The session's synchronization source identifier. May change if a
    /// collision with a remote participant is detected.
    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc.load(Ordering::Relaxed)
    }

    /// The remote address streams of this session send to
    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    /// Create a media stream between a local and a remote port. The
    /// stream is inert until `init` is called.
    pub fn create_stream(&self, local_port: u16, remote_port: u16) -> MediaStream {
        MediaStream::new(
            local_port,
            self.remote_addr,
            remote_port,
            self.config.clone(),
            self.cname.clone(),
            self.ssrc.clone(),
        )
    }
}
