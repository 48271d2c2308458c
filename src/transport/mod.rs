//! Datagram transport for RTP/RTCP
//!
//! Abstraction over the wire: bind a local port, send to a pre-resolved
//! remote address, receive whatever arrives. `SO_REUSEADDR` is not set;
//! each port has a single binding.

use std::net::SocketAddr;

use async_trait::async_trait;
use crate::Result;

/// Trait for datagram transport implementations
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Local address the transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// The configured remote address
    fn remote_addr(&self) -> SocketAddr;

    /// Send a datagram to the configured remote address
    async fn send(&self, bytes: &[u8]) -> Result<usize>;

    /// Send a datagram to an explicit destination
    async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize>;

    /// Receive one datagram, returning its length and origin
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

mod udp;

pub use udp::UdpTransport;
