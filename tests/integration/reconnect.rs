use std::time::Duration;

use k1_core::TlvType;
use k1_link::{AckCode, LinkError, LinkState, TransportError};

use crate::*;

async fn wait_for(link: &LinkHandle, want: impl Fn(&LinkState) -> bool) -> LinkState {
    let mut rx = link.subscribe();
    loop {
        let state = rx.borrow_and_update().clone();
        if want(&state) {
            return state;
        }
        rx.changed().await.expect("session alive");
    }
}

/// Successive failed opens schedule non-decreasing delays up to the ceiling.
#[tokio::test(start_paused = true)]
async fn test_backoff_delays_grow_to_ceiling() {
    let device = MockDevice::new(Script::default());
    device.refuse_connects.store(10, Ordering::SeqCst);
    let link = spawn_session(&device);
    let mut rx = link.subscribe();

    assert!(matches!(link.connect().await, Err(LinkError::Transport(_))));

    let mut delays = Vec::new();
    while delays.len() < 8 {
        // Each failed open publishes exactly one Reconnecting state.
        if let LinkState::Reconnecting { delay_ms, .. } = *rx.borrow_and_update() {
            delays.push(delay_ms);
        }
        rx.changed().await.unwrap();
    }

    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
    assert!(delays.iter().all(|&d| d <= 15_000), "{delays:?}");
    assert_eq!(*delays.last().unwrap(), 15_000);
    assert!(delays[0] >= 500 && delays[0] <= 750, "{delays:?}");
    link.close().await.unwrap();
}

/// The device drops the link; the session schedules one reconnect and
/// comes back to Ready on its own.
#[tokio::test(start_paused = true)]
async fn test_reconnects_after_unexpected_close() {
    let device = MockDevice::new(Script {
        status: Some(status_reply("1.0.0", 320, 0, 4089)),
        ack_fallback: Some(Reply::text("OK")),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();
    assert_eq!(device.connects.load(Ordering::SeqCst), 1);

    device.drop_link();
    let state = wait_for(&link, |s| matches!(s, LinkState::Reconnecting { .. })).await;
    let LinkState::Reconnecting { delay_ms, .. } = state else {
        unreachable!()
    };
    assert!((500..=750).contains(&delay_ms), "{delay_ms}");
    let countdown = link.reconnect_countdown().expect("countdown while reconnecting");
    assert!(countdown <= Duration::from_millis(delay_ms));

    wait_for(&link, |s| *s == LinkState::Ready).await;
    assert_eq!(device.connects.load(Ordering::SeqCst), 2);
    assert!(link.reconnect_countdown().is_none());

    let report = link.send_and_await_ack(vec![5u8; 100]).await.unwrap();
    assert!(report.is_ok());
}

/// A close in place of an ACK surfaces as DISCONNECTED, not a retry storm.
#[tokio::test(start_paused = true)]
async fn test_close_during_ack_wait() {
    let device = MockDevice::new(Script {
        acks: vec![Reply::Close].into(),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    let report = link.send_and_await_ack(vec![9u8; 16]).await.unwrap();
    assert_eq!(report.code(), &AckCode::Disconnected);
    assert_eq!(report.attempts, 1);
    assert!(matches!(link.state(), LinkState::Reconnecting { .. }));
}

/// A link that drops while the opening STATUS probe is outstanding is
/// not reported as connected.
#[tokio::test(start_paused = true)]
async fn test_drop_during_status_probe_fails_connect() {
    let device = MockDevice::new(Script {
        status: Some(Reply::Close),
        ..Script::default()
    });
    let link = spawn_session(&device);

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::Transport(TransportError::Closed)));
    assert!(matches!(link.state(), LinkState::Reconnecting { .. }));
    assert_eq!(device.connects.load(Ordering::SeqCst), 1);
    link.close().await.unwrap();
}

/// Backoff returns to the floor once a connection succeeds.
#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_successful_open() {
    let device = MockDevice::new(Script {
        status: Some(status_reply("1.0.0", 320, 0, 4089)),
        ..Script::default()
    });
    device.refuse_connects.store(4, Ordering::SeqCst);
    let link = spawn_session(&device);

    let _ = link.connect().await;
    wait_for(&link, |s| *s == LinkState::Ready).await;
    assert_eq!(device.connects.load(Ordering::SeqCst), 1);

    device.drop_link();
    let state = wait_for(&link, |s| matches!(s, LinkState::Reconnecting { .. })).await;
    let LinkState::Reconnecting { delay_ms, .. } = state else {
        unreachable!()
    };
    assert!((500..=750).contains(&delay_ms), "{delay_ms}");
    link.close().await.unwrap();
}

/// Idle pings every 30 s and a STATUS refresh every 15 s while ready.
#[tokio::test(start_paused = true)]
async fn test_keepalive_and_status_refresh() {
    let device = MockDevice::new(Script {
        status: Some(status_reply("1.0.0", 320, 0, 4089)),
        ..Script::default()
    });
    let link = spawn_session(&device);
    link.connect().await.unwrap();
    assert_eq!(device.count_sent(TlvType::Status), 1);

    tokio::time::sleep(Duration::from_millis(61_000)).await;

    assert_eq!(device.pings.load(Ordering::SeqCst), 2);
    assert_eq!(device.count_sent(TlvType::Status), 1 + 4);
    assert_eq!(link.state(), LinkState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_close_shuts_the_session_down() {
    let device = MockDevice::new(Script::default());
    let link = spawn_session(&device);
    link.connect().await.unwrap();

    link.close().await.unwrap();
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(matches!(link.status().await, Err(LinkError::SessionClosed)));
    assert!(matches!(
        link.send_and_await_ack(vec![1u8]).await,
        Err(LinkError::SessionClosed)
    ));
}
