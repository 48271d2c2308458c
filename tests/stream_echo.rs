//! End-to-end media stream scenarios over loopback UDP

use bytes::Bytes;
use serial_test::serial;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rtp_stream::frame::SEND_NONE;
use rtp_stream::{CtxFlag, MediaConfig, RtpContext};

fn localhost() -> std::net::IpAddr {
    "127.0.0.1".parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn echo_one_hundred_frames() {
    let ctx_a = RtpContext::new();
    let ctx_b = RtpContext::new();
    let session_a = ctx_a.create_session(localhost());
    let session_b = ctx_b.create_session(localhost());

    let mut a = session_a.create_stream(25000, 25002);
    let mut b = session_b.create_stream(25002, 25000);
    a.init().await.unwrap();
    b.init().await.unwrap();

    let frames: Vec<Bytes> = (0..100u32)
        .map(|i| {
            Bytes::from(
                (0..800u32)
                    .map(|j| ((i * 31 + j) % 256) as u8)
                    .collect::<Vec<u8>>(),
            )
        })
        .collect();

    for frame in &frames {
        a.push_frame(frame.clone(), SEND_NONE).await.unwrap();
    }

    let mut timestamps = Vec::new();
    for expected in &frames {
        let frame = tokio::time::timeout(Duration::from_secs(5), b.pull_frame())
            .await
            .expect("frame did not arrive")
            .expect("stream closed early");
        assert_eq!(&frame.payload, expected);
        timestamps.push(frame.timestamp);
    }

    // Timestamps ascend by the per-frame increment
    for pair in timestamps.windows(2) {
        assert!((pair[1].wrapping_sub(pair[0]) as i32) > 0);
    }

    // A clean loopback run loses nothing on either side
    assert_eq!(a.send_errors(), 0);
    assert_eq!(b.receive_overflows(), 0);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn fragmented_frame_reassembles() {
    let ctx_a = RtpContext::new();
    let ctx_b = RtpContext::new();
    let session_a = ctx_a.create_session(localhost());
    let session_b = ctx_b.create_session(localhost());

    let mut a = session_a.create_stream(25010, 25012);
    let mut b = session_b.create_stream(25012, 25010);
    a.configure_ctx(CtxFlag::FragmentingPayload).unwrap();
    b.configure_ctx(CtxFlag::FragmentingPayload).unwrap();

    // A large video-like unit with a ceiling of 1400 media bytes
    a.set_media_config(MediaConfig {
        fragment_size: 1400,
        ..MediaConfig::default()
    })
    .unwrap();

    a.init().await.unwrap();
    b.init().await.unwrap();

    let big: Bytes = Bytes::from(
        (0..16_000u32)
            .map(|i| ((i * 7) % 251) as u8)
            .collect::<Vec<u8>>(),
    );
    a.push_frame(big.clone(), SEND_NONE).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), b.pull_frame())
        .await
        .expect("fragmented frame did not arrive")
        .expect("stream closed early");

    assert_eq!(frame.payload, big);
    assert!(frame.marker);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn receive_hook_is_exclusive_with_pull() {
    let ctx_a = RtpContext::new();
    let ctx_b = RtpContext::new();
    let session_a = ctx_a.create_session(localhost());
    let session_b = ctx_b.create_session(localhost());

    let mut a = session_a.create_stream(25020, 25022);
    let mut b = session_b.create_stream(25022, 25020);
    a.init().await.unwrap();
    b.init().await.unwrap();

    let hook_count = Arc::new(AtomicU64::new(0));
    let counter = hook_count.clone();
    b.install_receive_hook(move |_frame| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // With a hook installed, pull returns immediately with nothing
    assert!(b.pull_frame().await.is_none());

    for _ in 0..10 {
        a.push_frame(Bytes::from(vec![0x42u8; 200]), SEND_NONE)
            .await
            .unwrap();
    }

    // The hook fires exactly once per frame
    tokio::time::timeout(Duration::from_secs(5), async {
        while hook_count.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("hook did not observe all frames");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hook_count.load(Ordering::SeqCst), 10);
    assert!(b.pull_frame().await.is_none());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn deallocation_hook_signals_completion() {
    let ctx_a = RtpContext::new();
    let ctx_b = RtpContext::new();
    let session_a = ctx_a.create_session(localhost());
    let session_b = ctx_b.create_session(localhost());

    let mut a = session_a.create_stream(25030, 25032);
    let mut b = session_b.create_stream(25032, 25030);
    a.init().await.unwrap();
    b.init().await.unwrap();

    let completed = Arc::new(AtomicU64::new(0));
    let counter = completed.clone();
    a.install_deallocation_hook(move |payload| {
        counter.fetch_add(payload.len() as u64, Ordering::SeqCst);
    });

    a.push_frame(Bytes::from(vec![1u8; 300]), SEND_NONE)
        .await
        .unwrap();
    a.push_frame(Bytes::from(vec![2u8; 500]), SEND_NONE)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while completed.load(Ordering::SeqCst) < 800 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("deallocation hook did not run");

    assert_eq!(completed.load(Ordering::SeqCst), 800);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn push_before_init_is_not_ready() {
    let ctx = RtpContext::new();
    let session = ctx.create_session(localhost());
    let stream = session.create_stream(25040, 25042);

    let err = stream.push_frame(Bytes::from_static(b"early"), SEND_NONE).await;
    assert!(matches!(err, Err(rtp_stream::Error::NotReady)));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn close_is_idempotent_and_pull_drains() {
    let ctx = RtpContext::new();
    let session = ctx.create_session(localhost());

    let mut a = session.create_stream(25050, 25052);
    a.init().await.unwrap();

    a.close().await.unwrap();
    a.close().await.unwrap();

    assert!(a.pull_frame().await.is_none());
}
