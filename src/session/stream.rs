//! The media stream: socket, sender, receiver, optional RTCP and ZRTP
//!
//! A stream is constructed inert. `init` binds the socket, optionally
//! runs key agreement, and spawns the workers; `close` signals the
//! workers, joins them and emits the RTCP BYE.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::{CtxFlag, CtxParameter, MediaConfig, StreamConfig};
use crate::error::Error;
use crate::frame::MediaFrame;
use crate::payload::PayloadFormat;
use crate::rtcp::{ParticipantTable, RtcpSession, SenderStats};
use crate::transport::{DatagramTransport, UdpTransport};
use crate::zrtp::{self, Zrtp, ZrtpConfig, ZrtpRole, ZrtpSecrets};
use crate::{Result, RtpSsrc};

use super::receiver::RtpReceiver;
use super::sender::RtpSender;
use super::{DeallocHook, ReceiveHook};

/// Everything that exists only between `init` and `close`
struct StreamRuntime {
    transport: Arc<UdpTransport>,
    sender: RtpSender,
    receiver: RtpReceiver,
    rtcp: Option<Arc<RtcpSession>>,
    srtp: Option<ZrtpSecrets>,
    shutdown: watch::Sender<bool>,
}

/// One bidirectional media stream between a local and a remote port
pub struct MediaStream {
    local_port: u16,
    remote_addr: IpAddr,
    remote_port: u16,
    config: StreamConfig,
    media: MediaConfig,
    cname: String,
    ssrc: Arc<AtomicU32>,
    recv_hook: Arc<Mutex<Option<ReceiveHook>>>,
    dealloc_hook: Arc<Mutex<Option<DeallocHook>>>,
    runtime: Option<StreamRuntime>,
}

impl MediaStream {
    pub(crate) fn new(
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
        config: StreamConfig,
        cname: String,
        ssrc: Arc<AtomicU32>,
    ) -> Self {
        Self {
            local_port,
            remote_addr,
            remote_port,
            config,
            media: MediaConfig::default(),
            cname,
            ssrc,
            recv_hook: Arc::new(Mutex::new(None)),
            dealloc_hook: Arc::new(Mutex::new(None)),
            runtime: None,
        }
    }

    /// Current SSRC of the owning session
    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc.load(Ordering::Relaxed)
    }

    /// Enable a boolean context flag. Only effective before `init`.
    pub fn configure_ctx(&mut self, flag: CtxFlag) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::InvalidValue(
                "stream already initialized".to_string(),
            ));
        }
        self.config.set_flag(flag);
        Ok(())
    }

    /// Set a numeric context parameter. Only effective before `init`;
    /// negative or out-of-range values are rejected.
    pub fn configure_ctx_value(&mut self, param: CtxParameter, value: i64) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::InvalidValue(
                "stream already initialized".to_string(),
            ));
        }
        self.config.set_value(param, value)
    }

    /// Replace the media parameters (payload type, clock rate, fragment
    /// ceiling). Only effective before `init`.
    pub fn set_media_config(&mut self, media: MediaConfig) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::InvalidValue(
                "stream already initialized".to_string(),
            ));
        }
        self.media = media;
        Ok(())
    }

    /// The media parameters in effect
    pub fn get_media_config(&self) -> MediaConfig {
        self.media.clone()
    }

    /// Bind the socket, run key agreement when SRTP is enabled, spawn the
    /// workers and start RTCP when enabled
    pub async fn init(&mut self) -> Result<()> {
        if self.runtime.is_some() {
            return Err(Error::InvalidValue(
                "stream already initialized".to_string(),
            ));
        }

        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.local_port);
        let remote = SocketAddr::new(self.remote_addr, self.remote_port);
        let transport = Arc::new(UdpTransport::bind(local, remote).await?);

        // Key agreement precedes media; its task owns the socket until
        // the keys are ready
        let srtp = if self.config.has_flag(CtxFlag::EnableSrtp) {
            let zrtp = Zrtp::new(
                ZrtpConfig {
                    client_id: self.cname.clone(),
                    role: ZrtpRole::Initiator,
                    ..ZrtpConfig::default()
                },
                self.ssrc.load(Ordering::Relaxed),
            )?;
            let secrets = zrtp::run(zrtp, &transport).await?;
            info!("ZRTP secured, SAS {}", secrets.sas);
            Some(secrets)
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        let table = Arc::new(ParticipantTable::new());
        let sender_stats = Arc::new(SenderStats::default());
        let formatter = PayloadFormat::from_config(&self.config, &self.media);

        let sender = RtpSender::spawn(
            transport.clone(),
            formatter.clone(),
            self.media.clone(),
            self.ssrc.clone(),
            self.config.max_queued_frames,
            self.dealloc_hook.clone(),
            sender_stats.clone(),
            shutdown.subscribe(),
        );

        let receiver = RtpReceiver::spawn(
            transport.clone(),
            &formatter,
            &self.media,
            self.ssrc.clone(),
            &self.config,
            table.clone(),
            self.recv_hook.clone(),
            shutdown.subscribe(),
        );

        let rtcp = if self.config.has_flag(CtxFlag::EnableRtcp) {
            // Control runs on the next port up, per convention
            let rtcp_local_port = self.local_port.checked_add(1).ok_or_else(|| {
                Error::InvalidValue("no room for the RTCP port above the RTP port".to_string())
            })?;
            let rtcp_remote_port = self.remote_port.checked_add(1).ok_or_else(|| {
                Error::InvalidValue("no room for the RTCP port above the RTP port".to_string())
            })?;
            let rtcp_local =
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), rtcp_local_port);
            let rtcp_remote = SocketAddr::new(self.remote_addr, rtcp_remote_port);
            let rtcp_transport = UdpTransport::bind(rtcp_local, rtcp_remote).await?;

            let session = Arc::new(RtcpSession::new(
                rtcp_transport,
                self.ssrc.clone(),
                self.cname.clone(),
                table,
                sender_stats,
                sender.timestamp_handle(),
                &self.config,
            ));
            session.start()?;
            Some(session)
        } else {
            None
        };

        debug!(
            "Media stream up: {} -> {}:{}",
            transport.local_addr()?,
            self.remote_addr,
            self.remote_port
        );

        self.runtime = Some(StreamRuntime {
            transport,
            sender,
            receiver,
            rtcp,
            srtp,
            shutdown,
        });
        Ok(())
    }

    /// Enqueue a frame for transmission. `flags` is a bitmask of the
    /// `SEND_*` constants in [`crate::frame`].
    pub async fn push_frame(&self, payload: Bytes, flags: u32) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or(Error::NotReady)?;
        runtime.sender.push(payload, flags).await
    }

    /// Await the next reassembled frame; `None` after `close` or while a
    /// receive hook is installed
    pub async fn pull_frame(&self) -> Option<MediaFrame> {
        let runtime = self.runtime.as_ref()?;
        runtime.receiver.pull().await
    }

    /// Install a callback invoked once per reassembled frame on the
    /// receive worker. Replaces any previous hook; `pull_frame` returns
    /// `None` from now on.
    pub fn install_receive_hook<F>(&self, hook: F)
    where
        F: Fn(MediaFrame) + Send + Sync + 'static,
    {
        *self.recv_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Install a callback invoked once per pushed frame after its last
    /// fragment has left the socket. Replaces any previous hook.
    pub fn install_deallocation_hook<F>(&self, hook: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        *self.dealloc_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// The RTCP session when enabled and initialized
    pub fn rtcp(&self) -> Option<Arc<RtcpSession>> {
        self.runtime.as_ref()?.rtcp.clone()
    }

    /// SRTP key material negotiated by ZRTP, when SRTP was enabled
    pub fn srtp_keys(&self) -> Option<&ZrtpSecrets> {
        self.runtime.as_ref()?.srtp.as_ref()
    }

    /// Local address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.runtime
            .as_ref()
            .ok_or(Error::NotReady)?
            .transport
            .local_addr()
    }

    /// Frames evicted from the delivery ring because nobody pulled
    pub fn receive_overflows(&self) -> u64 {
        self.runtime
            .as_ref()
            .map_or(0, |rt| rt.receiver.ring_dropped())
    }

    /// Socket-level send failures counted by the send worker
    pub fn send_errors(&self) -> u64 {
        self.runtime
            .as_ref()
            .map_or(0, |rt| rt.sender.send_errors())
    }

    /// Stop the workers, join them and terminate RTCP with a BYE. Safe
    /// to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        let mut runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => return Ok(()),
        };

        if let Some(rtcp) = &runtime.rtcp {
            if let Err(e) = rtcp.terminate().await {
                warn!("RTCP terminate failed: {}", e);
            }
        }

        let _ = runtime.shutdown.send(true);
        runtime.sender.join().await;
        runtime.receiver.join().await;

        debug!("Media stream closed");
        Ok(())
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        // `close` is the orderly path; abort what is left if the caller
        // dropped the stream while operational
        if let Some(mut runtime) = self.runtime.take() {
            let _ = runtime.shutdown.send(true);
            runtime.sender.abort();
            runtime.receiver.abort();
        }
    }
}
