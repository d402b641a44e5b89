use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use k1_core::TlvType;
use k1_link::{AckCode, CancelFlag, LinkError, LinkState};

use crate::*;

fn device_with_acks(acks: Vec<Reply>) -> Arc<MockDevice> {
    MockDevice::new(Script {
        status: Some(status_reply("1.0.0", 320, 1 << 20, 4089)),
        acks: acks.into(),
        ..Script::default()
    })
}

/// BUSY twice, then OK: acknowledged on the third attempt.
#[tokio::test(start_paused = true)]
async fn test_busy_twice_then_ok() {
    let device = device_with_acks(vec![
        Reply::text("BUSY"),
        Reply::text(r#"{"ok":false,"code":"BUSY"}"#),
        Reply::text("OK BYTES=64 CRC=OK SEQ=1"),
    ]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let started = Instant::now();
    let report = link.send_and_await_ack(vec![7u8; 64]).await.unwrap();

    assert!(report.is_ok());
    assert_eq!(report.attempts, 3);
    assert_eq!(report.retries(), 2);
    assert_eq!(report.reply.bytes, Some(64));
    assert_eq!(report.reply.crc_ok, Some(true));
    assert_eq!(device.count_sent(TlvType::PutBegin), 3);
    assert_eq!(device.count_sent(TlvType::PutEnd), 3);
    // 300 ms after the first failure, 600 ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(900));
}

/// An ACK that shows up after its attempt timed out belongs to that
/// attempt, not to the retry that follows it.
#[tokio::test(start_paused = true)]
async fn test_late_ack_is_not_credited_to_the_retry() {
    let device = device_with_acks(vec![
        Reply::Late(3100, Box::new(Reply::text("OK"))),
        Reply::text("CODE=STORAGE_FULL"),
        Reply::text("OK"),
    ]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let first = link.send_and_await_ack(vec![3u8; 40]).await.unwrap();
    assert_eq!(first.code(), &AckCode::StorageFull);
    assert_eq!(first.attempts, 2);

    let second = link.send_and_await_ack(vec![4u8; 40]).await.unwrap();
    assert!(second.is_ok());
    assert_eq!(second.attempts, 1);
    assert_eq!(device.count_sent(TlvType::PutEnd), 3);
}

/// A silent device exhausts exactly three attempts.
#[tokio::test(start_paused = true)]
async fn test_timeout_exhausts_three_attempts() {
    let device = device_with_acks(vec![]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let started = Instant::now();
    let report = link.send_and_await_ack(vec![1u8; 10]).await.unwrap();

    assert!(!report.is_ok());
    assert_eq!(report.code(), &AckCode::Timeout);
    assert_eq!(report.attempts, 3);
    assert_eq!(device.count_sent(TlvType::PutEnd), 3);
    assert!(started.elapsed() >= Duration::from_millis(3 * 3000 + 300 + 600));
    // Exhaustion is a per-frame result, not a dead link.
    assert_eq!(link.state(), LinkState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_error_is_not_retried() {
    let device = device_with_acks(vec![
        Reply::Binary(frame(TlvType::Error, b"\x04storage full")),
        Reply::text("OK"),
    ]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let report = link.send_and_await_ack(vec![0u8; 32]).await.unwrap();
    assert_eq!(report.code(), &AckCode::StorageFull);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.reply.message.as_deref(), Some("storage full"));
    assert_eq!(device.count_sent(TlvType::PutEnd), 1);
}

#[tokio::test(start_paused = true)]
async fn test_crc_mismatch_frame_is_retried() {
    let device = device_with_acks(vec![
        Reply::Binary(frame(TlvType::Error, &[0x02])),
        Reply::Binary(frame(TlvType::Status, b"\x05intro")),
    ]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let report = link.send_and_await_ack(vec![0u8; 32]).await.unwrap();
    assert!(report.is_ok());
    assert_eq!(report.attempts, 2);
    assert_eq!(report.reply.message.as_deref(), Some("intro"));
}

/// The plan on the wire tiles the payload and carries its CRC.
#[tokio::test(start_paused = true)]
async fn test_upload_frames_on_the_wire() {
    let device = device_with_acks(vec![Reply::text("OK")]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let report = link.send_and_await_ack(payload.clone()).await.unwrap();
    assert!(report.is_ok());
    assert_eq!(report.crc, k1_core::crc32(&payload));

    let data = device.sent_of(TlvType::PutData);
    assert_eq!(data.len(), 3);
    let mut rebuilt = Vec::new();
    for f in &data {
        let len = u16::from_be_bytes([f[1], f[2]]) as usize;
        let offset = u32::from_le_bytes([f[3], f[4], f[5], f[6]]) as usize;
        assert_eq!(offset, rebuilt.len());
        rebuilt.extend_from_slice(&f[7..3 + len]);
    }
    assert_eq!(rebuilt, payload);
}

/// A device-advertised max chunk replaces the default for the session.
#[tokio::test(start_paused = true)]
async fn test_status_probe_sets_chunk_size() {
    let device = MockDevice::new(Script {
        status: Some(status_reply("2.1.0", 320, 500_000, 1024)),
        ack_fallback: Some(Reply::text("OK")),
        ..Script::default()
    });
    let link = spawn_session(&device);

    let status = link.connect().await.unwrap().expect("status reported");
    assert_eq!(status.version.as_deref(), Some("2.1.0"));
    assert_eq!(status.led_count, Some(320));
    assert_eq!(status.max_chunk, Some(1024));
    assert_eq!(link.state(), LinkState::Ready);

    link.send_and_await_ack(vec![0u8; 3000]).await.unwrap();
    assert_eq!(device.count_sent(TlvType::PutData), 3);
}

#[tokio::test(start_paused = true)]
async fn test_ready_without_status_reply() {
    let device = MockDevice::new(Script::default());
    let link = spawn_session(&device);

    let status = link.connect().await.unwrap();
    assert!(status.is_none());
    assert_eq!(link.state(), LinkState::Ready);
    assert_eq!(device.count_sent(TlvType::Status), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_without_connection_is_terminal() {
    let device = device_with_acks(vec![Reply::text("OK")]);
    let link = spawn_session(&device);

    let report = link.send_and_await_ack(vec![1u8; 8]).await.unwrap();
    assert_eq!(report.code(), &AckCode::Disconnected);
    assert_eq!(report.attempts, 1);
    assert!(device.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_oversize_payload_rejected_before_io() {
    let device = device_with_acks(vec![Reply::text("OK")]);
    let link = spawn_session(&device);
    link.connect().await.unwrap();
    let before = device.sent.lock().unwrap().len();

    let err = link
        .send_and_await_ack(vec![0u8; 262_145])
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Wire(_)));
    assert_eq!(device.sent.lock().unwrap().len(), before);
}

/// Two callers sharing one session never interleave their uploads.
#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_stay_ordered() {
    let device = MockDevice::new(Script {
        ack_fallback: Some(Reply::text("OK")),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let a = link.clone();
    let b = link.clone();
    let (ra, rb) = tokio::join!(
        a.send_and_await_ack(vec![0xAA; 9000]),
        b.send_and_await_ack(vec![0xBB; 9000]),
    );
    assert!(ra.unwrap().is_ok());
    assert!(rb.unwrap().is_ok());

    let kinds: Vec<u8> = device
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|f| f[0])
        .filter(|k| *k != 0x30)
        .collect();
    assert_eq!(kinds, vec![1, 2, 2, 2, 3, 1, 2, 2, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_inventory_listing_and_timeout() {
    let device = MockDevice::new(Script {
        list: Some(list_reply(&[("aurora", 4096, 1_700_000_000), ("ember", 812, 1_700_000_100)])),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let entries = link.list_patterns().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "aurora");
    assert_eq!(entries[1].size, 812);

    // The device stops answering: the previous listing survives.
    device.script.lock().unwrap().list = Some(Reply::Silence);
    let started = Instant::now();
    let again = link.list_patterns().await.unwrap();
    assert_eq!(again, entries);
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert_eq!(device.count_sent(TlvType::List), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_caps_at_frame_table_size() {
    let device = MockDevice::new(Script {
        ack_fallback: Some(Reply::text("OK")),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let frames: Vec<Bytes> = (0..300u32)
        .map(|i| Bytes::from(vec![(i % 256) as u8; 960]))
        .collect();
    let started = Instant::now();
    let report = link
        .stream_sequence(&frames, 100.0, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(report.sent, 273);
    assert_eq!(report.failed, 0);
    assert!(report.truncated);
    assert!(!report.cancelled);
    assert_eq!(device.count_sent(TlvType::PutEnd), 273);
    assert!(started.elapsed() >= Duration::from_millis(272 * 10));
}

#[tokio::test(start_paused = true)]
async fn test_stream_cancel_stops_between_frames() {
    let device = MockDevice::new(Script {
        ack_fallback: Some(Reply::text("OK")),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let frames: Vec<Bytes> = (0..50).map(|_| Bytes::from(vec![1u8; 30])).collect();
    let cancel = CancelFlag::new();
    let stream = {
        let link = link.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { link.stream_sequence(&frames, 20.0, &cancel).await })
    };

    // Frames go out every 50 ms; cancel partway through the fourth gap.
    tokio::time::sleep(Duration::from_millis(175)).await;
    cancel.cancel();
    let report = stream.await.unwrap().unwrap();

    assert!(report.cancelled);
    assert_eq!(report.sent, 4);
    assert_eq!(device.count_sent(TlvType::PutEnd), 4);
}

#[tokio::test(start_paused = true)]
async fn test_stream_counts_failures_and_continues() {
    let device = MockDevice::new(Script {
        acks: vec![
            Reply::text("OK"),
            Reply::Binary(frame(TlvType::Error, &[0x03])),
            Reply::text("OK"),
        ]
        .into(),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let frames: Vec<Bytes> = (0..3).map(|_| Bytes::from_static(b"rgb")).collect();
    let report = link
        .stream_sequence(&frames, 60.0, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);

    let err = link
        .stream_sequence(&frames, 0.0, &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::InvalidFps(_)));
}
