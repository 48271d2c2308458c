//! UDP implementation of the datagram transport

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::Error;
use crate::Result;

use super::DatagramTransport;

/// IPv4 UDP transport bound to one local port
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote: Mutex<SocketAddr>,
}

impl UdpTransport {
    /// Bind `local` and remember `remote` as the send destination
    pub async fn bind(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Generic(format!("Failed to bind {}: {}", local, e)))?;

        debug!(
            "Bound UDP socket {} -> {}",
            socket.local_addr().map_err(Error::from)?,
            remote
        );

        Ok(Self {
            socket: Arc::new(socket),
            remote: Mutex::new(remote),
        })
    }

    /// Re-point the transport at a different remote endpoint
    pub fn set_remote(&self, remote: SocketAddr) {
        *self.remote.lock().unwrap() = remote;
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::Generic(format!("Failed to get local address: {}", e)))
    }

    fn remote_addr(&self) -> SocketAddr {
        *self.remote.lock().unwrap()
    }

    async fn send(&self, bytes: &[u8]) -> Result<usize> {
        let remote = self.remote_addr();
        self.send_to(bytes, remote).await
    }

    async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize> {
        self.socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| Error::SendError(format!("{} -> {}: {}", bytes.len(), dest, e)))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| Error::RecvError(e.to_string()))
    }
}
