//! Periodic RTCP reporter per RFC 3550 §6
//!
//! A self-rescheduling runner that owns the control socket (conventionally
//! the RTP port + 1), emits sender/receiver reports on a randomized
//! interval, tracks membership, and sends a single BYE at teardown.

mod participant;

pub use participant::{Participant, ParticipantTable, SenderStats, StatBlock};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::context::StreamConfig;
use crate::error::Error;
use crate::packet::rtcp::{
    NtpTimestamp, RtcpGoodbye, RtcpPacket, RtcpReceiverReport, RtcpSenderReport,
    RtcpSourceDescription,
};
use crate::transport::{DatagramTransport, UdpTransport};
use crate::{Result, RtpSsrc};

/// Deterministic minimum report interval
pub const RTCP_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Compensation for the convergence bias of interval randomization
/// (RFC 3550 §6.3.1: e - 3/2)
pub const RTCP_INTERVAL_COMPENSATION: f64 = 1.21828;

/// Assumed compound packet size before anything was sent or received
const INITIAL_AVG_RTCP_SIZE: f64 = 128.0;

/// Scheduler variables named per RFC 3550 §6.3
struct ReportState {
    /// Last transmission time
    tp: Instant,

    /// Next scheduled transmission time
    tn: Instant,

    /// Member estimate when `tn` was last recomputed
    pmembers: usize,

    /// True until the first report has been sent
    initial: bool,

    /// True when we sent RTP since the second-previous report
    we_sent: bool,

    /// Average compound RTCP packet size over sent and received packets
    avg_rtcp_size: f64,

    /// Local RTP packet count at the last and second-to-last report
    packets_at_last_report: u64,
    packets_at_prior_report: u64,
}

struct RtcpInner {
    ssrc: Arc<AtomicU32>,
    cname: String,
    transport: UdpTransport,
    table: Arc<ParticipantTable>,
    sender_stats: Arc<SenderStats>,

    /// Current outgoing RTP timestamp, mirrored into sender reports
    sender_rtp_ts: Arc<AtomicU32>,

    /// RTCP bandwidth in octets per second
    rtcp_bw: f64,

    state: Mutex<ReportState>,
    active: AtomicBool,
    bad_packets: AtomicU64,
    reports_sent: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// The RTCP session: reporter state plus its runner task
pub struct RtcpSession {
    inner: Arc<RtcpInner>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl RtcpSession {
    /// Create an RTCP session over an already-bound control transport
    pub fn new(
        transport: UdpTransport,
        ssrc: Arc<AtomicU32>,
        cname: String,
        table: Arc<ParticipantTable>,
        sender_stats: Arc<SenderStats>,
        sender_rtp_ts: Arc<AtomicU32>,
        config: &StreamConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let now = Instant::now();

        let inner = Arc::new(RtcpInner {
            ssrc,
            cname,
            transport,
            table,
            sender_stats,
            sender_rtp_ts,
            rtcp_bw: config.rtcp_bandwidth().max(1.0),
            state: Mutex::new(ReportState {
                tp: now,
                tn: now,
                pmembers: 1,
                initial: true,
                we_sent: false,
                avg_rtcp_size: INITIAL_AVG_RTCP_SIZE,
                packets_at_last_report: 0,
                packets_at_prior_report: 0,
            }),
            active: AtomicBool::new(false),
            bad_packets: AtomicU64::new(0),
            reports_sent: AtomicU64::new(0),
            shutdown_tx,
        });

        Self {
            inner,
            runner: Mutex::new(None),
        }
    }

    /// Start the runner. Returns `MemoryError` if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut guard = self
            .runner
            .lock()
            .map_err(|_| Error::Generic("RTCP runner lock poisoned".to_string()))?;
        if guard.is_some() {
            return Err(Error::MemoryError("RTCP runner already spawned".to_string()));
        }

        self.inner.active.store(true, Ordering::SeqCst);

        // Schedule the first report from now
        {
            let mut state = self.inner.state.lock().unwrap();
            let interval = compute_interval(&self.inner, &state);
            state.tp = Instant::now();
            state.tn = state.tp + interval;
            state.pmembers = self.inner.table.members();
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_loop(inner));
        *guard = Some(handle);

        debug!("RTCP runner started");
        Ok(())
    }

    /// Whether the session is still considered active
    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Pre-register a remote participant
    pub fn add_participant(&self, ssrc: RtpSsrc) {
        self.inner.table.add_participant(ssrc);
    }

    /// Shared participant table, also mutated by the receive worker
    pub fn table(&self) -> Arc<ParticipantTable> {
        self.inner.table.clone()
    }

    /// Number of reports emitted so far
    pub fn reports_sent(&self) -> u64 {
        self.inner.reports_sent.load(Ordering::Relaxed)
    }

    /// Number of malformed control packets counted and dropped
    pub fn bad_packets(&self) -> u64 {
        self.inner.bad_packets.load(Ordering::Relaxed)
    }

    /// Build and send a report immediately, outside the schedule
    pub async fn generate_report(&self) -> Result<()> {
        send_report(&self.inner).await
    }

    /// End the session: emit one BYE to all participants, stop and join
    /// the runner. Safe to call repeatedly; only the first call sends BYE.
    pub async fn terminate(&self) -> Result<()> {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = send_bye(&self.inner).await {
            warn!("Failed to send RTCP BYE: {}", e);
        }

        let _ = self.inner.shutdown_tx.send(true);

        let handle = {
            let mut guard = self
                .runner
                .lock()
                .map_err(|_| Error::Generic("RTCP runner lock poisoned".to_string()))?;
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        debug!("RTCP session terminated");
        Ok(())
    }
}

/// Deterministic interval `T = max(T_min, avg_rtcp_size * n / rtcp_bw)`
fn deterministic_interval(inner: &RtcpInner, state: &ReportState) -> Duration {
    let members = inner.table.members();
    let senders = inner.table.senders() + usize::from(state.we_sent);

    // Senders get a quarter of the bandwidth when they are a minority
    let n = if state.we_sent && senders * 4 < members {
        senders.max(1)
    } else {
        members.max(1)
    };

    let t_min = if state.initial {
        RTCP_MIN_INTERVAL.as_secs_f64() / 2.0
    } else {
        RTCP_MIN_INTERVAL.as_secs_f64()
    };

    let t = (state.avg_rtcp_size * n as f64 / inner.rtcp_bw).max(t_min);
    Duration::from_secs_f64(t)
}

/// Actual interval: deterministic value randomized over [0.5, 1.5) and
/// compensated, floored at half the applicable minimum so report gaps
/// stay bounded
fn compute_interval(inner: &RtcpInner, state: &ReportState) -> Duration {
    let t = deterministic_interval(inner, state).as_secs_f64();
    let t_min = if state.initial {
        RTCP_MIN_INTERVAL.as_secs_f64() / 2.0
    } else {
        RTCP_MIN_INTERVAL.as_secs_f64()
    };
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    let randomized = t * factor / RTCP_INTERVAL_COMPENSATION;
    Duration::from_secs_f64(randomized.max(t_min / 2.0))
}

/// Runner: wait for `tn` or inbound control packets, whichever first
async fn run_loop(inner: Arc<RtcpInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut buf = vec![0u8; 2048];

    loop {
        let deadline = inner.state.lock().unwrap().tn;

        tokio::select! {
            _ = shutdown.changed() => break,

            recv = inner.transport.recv_from(&mut buf) => {
                match recv {
                    Ok((len, from)) => {
                        trace!("RTCP datagram of {} bytes from {}", len, from);
                        if let Err(e) = handle_incoming_packet(&inner, &buf[..len]) {
                            debug!("Dropping malformed RTCP packet: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("RTCP receive error: {}", e);
                    }
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                // tn may have been moved by reverse reconsideration while
                // this sleep was pending
                let due = {
                    let state = inner.state.lock().unwrap();
                    state.tn <= Instant::now()
                };
                if !due {
                    continue;
                }

                prune_timeouts(&inner);

                if let Err(e) = send_report(&inner).await {
                    warn!("Failed to send RTCP report: {}", e);
                }

                let mut state = inner.state.lock().unwrap();
                state.tp = state.tn;
                state.initial = false;
                state.pmembers = inner.table.members();
                let interval = compute_interval(&inner, &state);
                state.tn = state.tp + interval;
            }
        }
    }
}

/// Remove senders not heard for 2·T and members not heard for 5·T_min,
/// with T recomputed at purge time
fn prune_timeouts(inner: &RtcpInner) {
    let t = {
        let state = inner.state.lock().unwrap();
        deterministic_interval(inner, &state)
    };
    inner.table.prune(t * 2, RTCP_MIN_INTERVAL * 5);
}

/// Emit SR (when we sent RTP since the previous reports) or RR, followed
/// by an SDES CNAME chunk
async fn send_report(inner: &RtcpInner) -> Result<()> {
    let ssrc = inner.ssrc.load(Ordering::Relaxed);
    let packets_now = inner.sender_stats.processed_packets();

    let we_sent = {
        let mut state = inner.state.lock().unwrap();
        let we_sent = packets_now > state.packets_at_prior_report;
        state.we_sent = we_sent;
        state.packets_at_prior_report = state.packets_at_last_report;
        state.packets_at_last_report = packets_now;
        we_sent
    };

    let report_blocks = inner.table.report_blocks(StdInstant::now());

    let report = if we_sent {
        let mut sr = RtcpSenderReport::new(ssrc);
        sr.ntp_timestamp = NtpTimestamp::now();
        sr.rtp_timestamp = inner.sender_rtp_ts.load(Ordering::Relaxed);
        sr.sender_packet_count = packets_now as u32;
        sr.sender_octet_count = inner.sender_stats.processed_bytes() as u32;
        sr.report_blocks = report_blocks;
        RtcpPacket::SenderReport(sr)
    } else {
        let mut rr = RtcpReceiverReport::new(ssrc);
        rr.report_blocks = report_blocks;
        RtcpPacket::ReceiverReport(rr)
    };

    let sdes = RtcpPacket::SourceDescription(RtcpSourceDescription::cname(
        ssrc,
        inner.cname.clone(),
    ));

    let wire = RtcpPacket::serialize_compound(&[report, sdes])?;
    update_avg_size(inner, wire.len());
    inner.transport.send(&wire).await?;

    inner.reports_sent.fetch_add(1, Ordering::Relaxed);
    trace!(
        "Sent RTCP {} of {} bytes",
        if we_sent { "SR" } else { "RR" },
        wire.len()
    );
    Ok(())
}

/// Emit the BYE compound (RR + SDES + BYE, per RFC 3550 §6.1)
async fn send_bye(inner: &RtcpInner) -> Result<()> {
    let ssrc = inner.ssrc.load(Ordering::Relaxed);

    let rr = RtcpPacket::ReceiverReport(RtcpReceiverReport::new(ssrc));
    let sdes = RtcpPacket::SourceDescription(RtcpSourceDescription::cname(
        ssrc,
        inner.cname.clone(),
    ));
    let bye = RtcpPacket::Goodbye(RtcpGoodbye::new(ssrc).with_reason("teardown"));

    let wire = RtcpPacket::serialize_compound(&[rr, sdes, bye])?;
    update_avg_size(inner, wire.len());
    inner.transport.send(&wire).await?;

    debug!("Sent RTCP BYE for ssrc={:08x}", ssrc);
    Ok(())
}

/// `avg_rtcp_size` moving average over sent and received compound packets
fn update_avg_size(inner: &RtcpInner, size: usize) {
    let mut state = inner.state.lock().unwrap();
    state.avg_rtcp_size = size as f64 / 16.0 + state.avg_rtcp_size * 15.0 / 16.0;
}

/// Validate and dispatch one inbound compound packet. Malformed packets
/// are counted and dropped.
fn handle_incoming_packet(inner: &RtcpInner, data: &[u8]) -> Result<()> {
    let packets = match RtcpPacket::parse_compound(data) {
        Ok(packets) => packets,
        Err(e) => {
            inner.bad_packets.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };

    update_avg_size(inner, data.len());

    for packet in packets {
        match packet {
            RtcpPacket::SenderReport(sr) => {
                inner.table.record_sr(
                    sr.ssrc,
                    sr.ntp_timestamp.to_u32(),
                    sr.sender_packet_count,
                    sr.sender_octet_count,
                );
                trace!(
                    "SR from ssrc={:08x}: {} packets, {} octets",
                    sr.ssrc,
                    sr.sender_packet_count,
                    sr.sender_octet_count
                );
            }
            RtcpPacket::ReceiverReport(rr) => {
                inner.table.note_member(rr.ssrc);
            }
            RtcpPacket::SourceDescription(sdes) => {
                for chunk in &sdes.chunks {
                    inner.table.note_member(chunk.ssrc);
                }
            }
            RtcpPacket::Goodbye(bye) => {
                for ssrc in &bye.sources {
                    if inner.table.remove(*ssrc) {
                        debug!("Participant ssrc={:08x} left: {:?}", ssrc, bye.reason);
                        reverse_reconsideration(inner);
                    }
                }
            }
            RtcpPacket::App(app) => {
                trace!(
                    "APP packet from ssrc={:08x}, name={:?}",
                    app.ssrc,
                    std::str::from_utf8(&app.name).unwrap_or("????")
                );
            }
        }
    }

    Ok(())
}

/// RFC 3550 §6.3.4: when membership shrinks below `pmembers`, pull the
/// schedule in proportionally
fn reverse_reconsideration(inner: &RtcpInner) {
    let mut state = inner.state.lock().unwrap();
    let members = inner.table.members();
    if members >= state.pmembers || state.pmembers == 0 {
        return;
    }

    let now = Instant::now();
    let ratio = members as f64 / state.pmembers as f64;

    if state.tn > now {
        let remaining = state.tn.duration_since(now);
        state.tn = now + remaining.mul_f64(ratio);
    }
    let since_tp = now.duration_since(state.tp);
    state.tp = now - since_tp.mul_f64(ratio);

    state.pmembers = members;
}
