//! Send path: frame queue, formatter dispatch and the send worker

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::context::MediaConfig;
use crate::error::Error;
use crate::frame::SEND_SAME_TIMESTAMP;
use crate::packet::{RtpHeader, RtpPacket};
use crate::payload::{PacketizedPayload, PayloadFormat};
use crate::rtcp::SenderStats;
use crate::transport::{DatagramTransport, UdpTransport};
use crate::Result;

use super::DeallocHook;

/// One queued frame, already packetized so errors surfaced synchronously
struct SendJob {
    chunks: Vec<PacketizedPayload>,
    payload: Bytes,
    flags: u32,
}

/// The sending half of a media stream
pub(crate) struct RtpSender {
    queue: mpsc::Sender<SendJob>,
    formatter: PayloadFormat,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SenderStats>,
    current_ts: Arc<AtomicU32>,
    failed: Arc<AtomicBool>,
    send_errors: Arc<AtomicU64>,
}

impl RtpSender {
    /// Spawn the send worker over a bound transport
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        transport: Arc<UdpTransport>,
        formatter: PayloadFormat,
        media: MediaConfig,
        ssrc: Arc<AtomicU32>,
        max_queued_frames: usize,
        dealloc_hook: Arc<Mutex<Option<DeallocHook>>>,
        stats: Arc<SenderStats>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (queue_tx, mut queue_rx) = mpsc::channel::<SendJob>(max_queued_frames);

        // Randomized initial sequence number and timestamp
        let mut seq: u16 = rand::thread_rng().gen();
        let initial_ts: u32 = rand::thread_rng().gen();
        let current_ts = Arc::new(AtomicU32::new(initial_ts));
        let failed = Arc::new(AtomicBool::new(false));
        let send_errors = Arc::new(AtomicU64::new(0));

        let worker_ts = current_ts.clone();
        let worker_stats = stats.clone();
        let worker_failed = failed.clone();
        let worker_errors = send_errors.clone();
        let ts_increment = media.timestamp_increment();
        let payload_type = media.payload_type;

        let handle = tokio::spawn(async move {
            let mut timestamp = initial_ts;

            loop {
                let job = tokio::select! {
                    _ = shutdown.changed() => break,
                    job = queue_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                for chunk in &job.chunks {
                    let mut header = RtpHeader::new(
                        payload_type,
                        seq,
                        timestamp,
                        ssrc.load(Ordering::Relaxed),
                    );
                    header.marker = chunk.marker;

                    let packet = RtpPacket::new(header, chunk.data.clone());
                    let wire = match packet.serialize() {
                        Ok(wire) => wire,
                        Err(e) => {
                            error!("Failed to serialize RTP packet: {}", e);
                            worker_failed.store(true, Ordering::SeqCst);
                            break;
                        }
                    };

                    match transport.send(&wire).await {
                        Ok(_) => {
                            let overhead = (wire.len() - chunk.data.len()) as u64;
                            worker_stats.inc_processed_packets(1);
                            worker_stats.inc_processed_bytes(chunk.data.len() as u64);
                            worker_stats.inc_overhead_bytes(overhead);
                            worker_stats.inc_total_bytes(wire.len() as u64);
                            trace!("Sent RTP seq={} ts={} {} bytes", seq, timestamp, wire.len());
                        }
                        Err(e) => {
                            // Transient socket errors are counted; the
                            // packet is lost like any other datagram
                            worker_errors.fetch_add(1, Ordering::Relaxed);
                            debug!("RTP send failed for seq={}: {}", seq, e);
                        }
                    }

                    seq = seq.wrapping_add(1);
                }

                if job.flags & SEND_SAME_TIMESTAMP == 0 {
                    timestamp = timestamp.wrapping_add(ts_increment);
                    worker_ts.store(timestamp, Ordering::Relaxed);
                }

                // The frame has fully left the socket
                let hook = dealloc_hook.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook(job.payload);
                }
            }

            debug!("Send worker stopped");
        });

        Self {
            queue: queue_tx,
            formatter,
            handle: Some(handle),
            stats,
            current_ts,
            failed,
            send_errors,
        }
    }

    /// Enqueue one frame for transmission. Packetization errors
    /// (`InvalidValue`, `PayloadTooBig`) surface here; a dead worker
    /// surfaces as `Generic`.
    pub(crate) async fn push(&self, payload: Bytes, flags: u32) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidValue("zero-length frame".to_string()));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Generic("send worker failed".to_string()));
        }

        let chunks = self.formatter.packetize(payload.clone())?;
        self.queue
            .send(SendJob {
                chunks,
                payload,
                flags,
            })
            .await
            .map_err(|_| Error::Generic("send worker is gone".to_string()))
    }

    /// Handle to the current outgoing RTP timestamp (read by RTCP for
    /// sender reports)
    pub(crate) fn timestamp_handle(&self) -> Arc<AtomicU32> {
        self.current_ts.clone()
    }

    /// Shared sender statistics
    pub(crate) fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Socket-level send failures counted so far
    pub(crate) fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StreamConfig;
    use crate::payload::OpaqueFormat;
    use std::time::Duration;

    async fn sender_with_capture() -> (RtpSender, UdpTransport, watch::Sender<bool>) {
        let capture = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        )
        .await
        .unwrap();

        let transport = Arc::new(
            UdpTransport::bind(
                "127.0.0.1:0".parse().unwrap(),
                capture.local_addr().unwrap(),
            )
            .await
            .unwrap(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = StreamConfig::default();
        let sender = RtpSender::spawn(
            transport,
            PayloadFormat::Opaque(OpaqueFormat::new(1400)),
            MediaConfig::default(),
            Arc::new(AtomicU32::new(0x0102_0304)),
            config.max_queued_frames,
            Arc::new(Mutex::new(None)),
            Arc::new(SenderStats::default()),
            shutdown_rx,
        );

        (sender, capture, shutdown_tx)
    }

    #[tokio::test]
    async fn test_sequence_numbers_contiguous_on_wire() {
        let (sender, capture, _shutdown) = sender_with_capture().await;

        for i in 0..5u8 {
            sender
                .push(Bytes::from(vec![i; 100]), crate::frame::SEND_NONE)
                .await
                .unwrap();
        }

        let mut buf = [0u8; 2048];
        let mut seqs = Vec::new();
        let mut timestamps = Vec::new();
        for _ in 0..5 {
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(1),
                capture.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            let packet = RtpPacket::parse(&buf[..len]).unwrap();
            seqs.push(packet.header.sequence_number);
            timestamps.push(packet.header.timestamp);
            assert!(packet.header.marker);
            assert_eq!(packet.header.ssrc, 0x0102_0304);
        }

        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
        // Timestamps ascend by the per-frame increment (90 kHz / 30 fps)
        for pair in timestamps.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(3000));
        }
    }

    #[tokio::test]
    async fn test_same_timestamp_flag() {
        let (sender, capture, _shutdown) = sender_with_capture().await;

        sender
            .push(Bytes::from(vec![1; 10]), crate::frame::SEND_SAME_TIMESTAMP)
            .await
            .unwrap();
        sender
            .push(Bytes::from(vec![2; 10]), crate::frame::SEND_NONE)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = capture.recv_from(&mut buf).await.unwrap();
        let first = RtpPacket::parse(&buf[..len]).unwrap();
        let (len, _) = capture.recv_from(&mut buf).await.unwrap();
        let second = RtpPacket::parse(&buf[..len]).unwrap();

        assert_eq!(first.header.timestamp, second.header.timestamp);
    }

    #[tokio::test]
    async fn test_push_rejects_empty_and_oversize() {
        let (sender, _capture, _shutdown) = sender_with_capture().await;

        assert!(matches!(
            sender.push(Bytes::new(), 0).await,
            Err(Error::InvalidValue(_))
        ));
        assert!(matches!(
            sender.push(Bytes::from(vec![0u8; 2000]), 0).await,
            Err(Error::PayloadTooBig { .. })
        ));
    }

    #[tokio::test]
    async fn test_dealloc_hook_fires_per_frame() {
        let capture = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        )
        .await
        .unwrap();
        let transport = Arc::new(
            UdpTransport::bind(
                "127.0.0.1:0".parse().unwrap(),
                capture.local_addr().unwrap(),
            )
            .await
            .unwrap(),
        );

        let (counter_tx, mut counter_rx) = mpsc::unbounded_channel();
        let hook: DeallocHook = Arc::new(move |payload: Bytes| {
            let _ = counter_tx.send(payload.len());
        });

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let sender = RtpSender::spawn(
            transport,
            PayloadFormat::Opaque(OpaqueFormat::new(1400)),
            MediaConfig::default(),
            Arc::new(AtomicU32::new(1)),
            16,
            Arc::new(Mutex::new(Some(hook))),
            Arc::new(SenderStats::default()),
            shutdown_rx,
        );

        sender.push(Bytes::from(vec![0u8; 333]), 0).await.unwrap();

        let len = tokio::time::timeout(Duration::from_secs(1), counter_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 333);
    }

    #[tokio::test]
    async fn test_stats_updated() {
        let (sender, capture, _shutdown) = sender_with_capture().await;

        sender.push(Bytes::from(vec![0u8; 200]), 0).await.unwrap();

        let mut buf = [0u8; 2048];
        capture.recv_from(&mut buf).await.unwrap();

        // Give the worker a beat to finish its accounting after the send
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = sender.stats();
        assert_eq!(stats.processed_packets(), 1);
        assert_eq!(stats.processed_bytes(), 200);
        assert_eq!(stats.total_bytes(), 212); // 12-byte header
    }
}
