//! Receive path: socket drain, statistics, reassembly and delivery

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::context::{CtxFlag, MediaConfig, StreamConfig};
use crate::frame::MediaFrame;
use crate::packet::{hex_dump, RtpPacket};
use crate::payload::PayloadFormat;
use crate::rtcp::ParticipantTable;
use crate::transport::{DatagramTransport, UdpTransport};
use crate::zrtp::ZrtpPacket;

use super::ReceiveHook;

/// The receiving half of a media stream
pub(crate) struct RtpReceiver {
    ring: Arc<Mutex<VecDeque<MediaFrame>>>,
    notify: Arc<Notify>,
    hook: Arc<Mutex<Option<ReceiveHook>>>,
    closed: Arc<AtomicBool>,
    ring_dropped: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    /// Spawn the receive worker over a bound transport
    pub(crate) fn spawn(
        transport: Arc<UdpTransport>,
        formatter: &PayloadFormat,
        media: &MediaConfig,
        ssrc: Arc<AtomicU32>,
        config: &StreamConfig,
        table: Arc<ParticipantTable>,
        hook: Arc<Mutex<Option<ReceiveHook>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let ring = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let ring_dropped = Arc::new(AtomicU64::new(0));
        let malformed = Arc::new(AtomicU64::new(0));

        let mut depacketizer =
            formatter.depacketizer(config.reorder_window, config.reassembly_timeout);
        let strict = config.has_flag(CtxFlag::StrictSequenceCheck);
        let ring_capacity = config.max_queued_frames;
        let clock_rate = media.clock_rate;

        let worker_ring = ring.clone();
        let worker_notify = notify.clone();
        let worker_hook = hook.clone();
        let worker_closed = closed.clone();
        let worker_ring_dropped = ring_dropped.clone();
        let worker_malformed = malformed.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            let epoch = Instant::now();
            let mut highest_seq: Option<u16> = None;

            loop {
                let (len, _from) = tokio::select! {
                    _ = shutdown.changed() => break,
                    recv = transport.recv_from(&mut buf) => match recv {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Receive error: {}", e);
                            continue;
                        }
                    },
                };

                // Stray key-exchange retransmissions share the socket
                if ZrtpPacket::looks_like_zrtp(&buf[..len]) {
                    continue;
                }

                let packet = match RtpPacket::parse(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        worker_malformed.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Dropping malformed RTP datagram: {} [{}]",
                            e,
                            hex_dump(&buf[..len.min(16)])
                        );
                        continue;
                    }
                };

                let remote_ssrc = packet.header.ssrc;

                // Collision with our own SSRC forces a local reselection
                if remote_ssrc == ssrc.load(Ordering::Relaxed) {
                    let fresh: u32 = rand::thread_rng().gen();
                    ssrc.store(fresh, Ordering::Relaxed);
                    warn!(
                        "SSRC collision on {:08x}, reselected {:08x}",
                        remote_ssrc, fresh
                    );
                    continue;
                }

                let seq = packet.header.sequence_number;

                if strict {
                    if let Some(highest) = highest_seq {
                        if seq.wrapping_sub(highest) >= 0x8000 {
                            table.record_dropped(remote_ssrc);
                            trace!("Strict order drop seq={} behind {}", seq, highest);
                            continue;
                        }
                    }
                }
                if highest_seq.map_or(true, |h| seq.wrapping_sub(h) < 0x8000) {
                    highest_seq = Some(seq);
                }

                let arrival_ts_units =
                    (epoch.elapsed().as_secs_f64() * clock_rate as f64) as i64;
                table.record_rtp(
                    remote_ssrc,
                    seq,
                    packet.payload.len(),
                    len,
                    packet.header.timestamp,
                    arrival_ts_units,
                );

                let frames = match depacketizer.push(packet) {
                    Ok(frames) => frames,
                    Err(e) => {
                        worker_malformed.fetch_add(1, Ordering::Relaxed);
                        table.record_dropped(remote_ssrc);
                        debug!("Depacketizer rejected packet: {}", e);
                        continue;
                    }
                };

                for frame in frames {
                    let hook = worker_hook.lock().unwrap().clone();
                    match hook {
                        Some(hook) => hook(frame),
                        None => {
                            let mut ring = worker_ring.lock().unwrap();
                            if ring.len() >= ring_capacity {
                                ring.pop_front();
                                worker_ring_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            ring.push_back(frame);
                            drop(ring);
                            worker_notify.notify_one();
                        }
                    }
                }
            }

            worker_closed.store(true, Ordering::SeqCst);
            worker_notify.notify_waiters();
            debug!("Receive worker stopped");
        });

        Self {
            ring,
            notify,
            hook,
            closed,
            ring_dropped,
            malformed,
            handle: Some(handle),
        }
    }

    /// Await the next reassembled frame. Returns `None` after shutdown or
    /// while a receive hook is installed.
    pub(crate) async fn pull(&self) -> Option<MediaFrame> {
        loop {
            if self.hook.lock().unwrap().is_some() {
                return None;
            }

            let notified = self.notify.notified();

            if let Some(frame) = self.ring.lock().unwrap().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            notified.await;
        }
    }

    /// Frames evicted from the full delivery ring
    pub(crate) fn ring_dropped(&self) -> u64 {
        self.ring_dropped.load(Ordering::Relaxed)
    }

    /// Malformed datagrams counted and dropped
    pub(crate) fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Await worker exit after shutdown was signalled
    pub(crate) async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Abort the worker without waiting (teardown of last resort)
    pub(crate) fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
