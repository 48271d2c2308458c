//! Process-wide context and per-stream configuration
//!
//! A [`RtpContext`] is the factory from which sessions are created. It holds
//! the configuration defaults and the CNAME advertised in RTCP source
//! descriptions. Individual streams refine the defaults through
//! [`StreamConfig`] before `init`.

use std::net::IpAddr;
use std::time::Duration;

use rand::Rng;

use crate::error::Error;
use crate::session::RtpSession;
use crate::{Result, DEFAULT_FRAGMENT_SIZE, DEFAULT_REORDER_WINDOW};

/// Numeric context parameters accepted by `configure_ctx_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxParameter {
    /// Fragment reorder window, in sequence numbers
    ReorderWindowSize,

    /// Retention window for incomplete reassembly slots, in milliseconds
    ReassemblyTimeoutMs,

    /// Capacity of the outgoing frame queue and the receive ring
    MaxQueuedFrames,

    /// Share of the session bandwidth granted to RTCP, in permille
    RtcpBandwidthPermille,
}

/// Boolean context flags accepted by `configure_ctx`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxFlag {
    /// Run the RTCP reporter on RTP port + 1
    EnableRtcp = 1 << 0,

    /// Negotiate SRTP keys over ZRTP before media starts
    EnableSrtp = 1 << 1,

    /// Use the fragmenting payload formatter instead of the opaque one
    FragmentingPayload = 1 << 2,

    /// Drop inbound packets whose sequence number is not newer than the
    /// highest seen so far
    StrictSequenceCheck = 1 << 3,
}

/// Media parameters of one stream, carried through the generic stream API
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// RTP payload type for outgoing packets
    pub payload_type: u8,

    /// Clock rate of the payload format in Hz
    pub clock_rate: u32,

    /// Nominal frame rate used to derive the per-frame timestamp increment
    pub frame_rate: u32,

    /// Ceiling for a single fragment's media payload in bytes
    pub fragment_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            payload_type: 96,
            clock_rate: 90_000,
            frame_rate: 30,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }
}

impl MediaConfig {
    /// Timestamp units added after each frame
    pub fn timestamp_increment(&self) -> u32 {
        if self.frame_rate == 0 {
            0
        } else {
            self.clock_rate / self.frame_rate
        }
    }
}

/// Per-stream configuration values and flags
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Fragment reorder window in sequence numbers
    pub reorder_window: u16,

    /// How long an incomplete reassembly slot is retained
    pub reassembly_timeout: Duration,

    /// Capacity of the frame queue on both the send and receive side
    pub max_queued_frames: usize,

    /// Share of the session bandwidth granted to RTCP, in permille
    pub rtcp_bandwidth_permille: u32,

    /// Session bandwidth estimate in octets per second, the base for the
    /// RTCP bandwidth share
    pub session_bandwidth: u32,

    flags: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reorder_window: DEFAULT_REORDER_WINDOW,
            reassembly_timeout: Duration::from_millis(500),
            max_queued_frames: 128,
            rtcp_bandwidth_permille: 50,
            session_bandwidth: 8_000,
            flags: 0,
        }
    }
}

impl StreamConfig {
    /// Set a numeric context parameter. Negative values are rejected with
    /// `InvalidValue`.
    pub fn set_value(&mut self, param: CtxParameter, value: i64) -> Result<()> {
        if value < 0 {
            return Err(Error::InvalidValue(format!(
                "context parameter {:?} cannot be negative: {}",
                param, value
            )));
        }

        match param {
            CtxParameter::ReorderWindowSize => {
                if value > u16::MAX as i64 {
                    return Err(Error::InvalidValue(format!(
                        "reorder window {} exceeds 16-bit sequence space",
                        value
                    )));
                }
                self.reorder_window = value as u16;
            }
            CtxParameter::ReassemblyTimeoutMs => {
                self.reassembly_timeout = Duration::from_millis(value as u64);
            }
            CtxParameter::MaxQueuedFrames => {
                if value == 0 {
                    return Err(Error::InvalidValue(
                        "frame queue capacity cannot be zero".to_string(),
                    ));
                }
                self.max_queued_frames = value as usize;
            }
            CtxParameter::RtcpBandwidthPermille => {
                if value > 1000 {
                    return Err(Error::InvalidValue(format!(
                        "RTCP bandwidth share {} exceeds 1000 permille",
                        value
                    )));
                }
                self.rtcp_bandwidth_permille = value as u32;
            }
        }

        Ok(())
    }

    /// Enable a boolean context flag
    pub fn set_flag(&mut self, flag: CtxFlag) {
        self.flags |= flag as u32;
    }

    /// Whether a boolean context flag is enabled
    pub fn has_flag(&self, flag: CtxFlag) -> bool {
        self.flags & (flag as u32) != 0
    }

    /// RTCP bandwidth in octets per second derived from the session
    /// bandwidth and the configured share
    pub fn rtcp_bandwidth(&self) -> f64 {
        self.session_bandwidth as f64 * self.rtcp_bandwidth_permille as f64 / 1000.0
    }
}

/// Process-wide factory for RTP sessions
pub struct RtpContext {
    defaults: StreamConfig,
    cname: String,
}

impl RtpContext {
    /// Create a new context with default configuration and a random CNAME
    pub fn new() -> Self {
        let tag: u32 = rand::thread_rng().gen();
        Self {
            defaults: StreamConfig::default(),
            cname: format!("stream-{:08x}", tag),
        }
    }

    /// Override the CNAME advertised in RTCP source descriptions
    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = cname.into();
        self
    }

    /// Access the configuration defaults handed to new sessions
    pub fn defaults_mut(&mut self) -> &mut StreamConfig {
        &mut self.defaults
    }

    /// Create a session toward one remote address. Streams created from the
    /// session inherit this context's configuration defaults.
    pub fn create_session(&self, remote_addr: IpAddr) -> RtpSession {
        RtpSession::new(remote_addr, self.defaults.clone(), self.cname.clone())
    }
}

impl Default for RtpContext {
    fn default() -> Self {
        Self::new()
    }
}
