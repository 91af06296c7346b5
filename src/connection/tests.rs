//! Connection manager tests against a scripted relay
//!
//! Every test runs on paused tokio time, so backoff delays are exact and the
//! whole schedule runs in microseconds of wall time.

use super::*;
use crate::test_utils::{ScriptedConnector, sample_frame};
use crate::types::UpdateRate;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn manager(connector: &ScriptedConnector) -> FeedConnectionManager {
    FeedConnectionManager::new(connector.clone(), FeedOptions::default())
}

async fn wait_for(
    manager: &FeedConnectionManager,
    predicate: impl Fn(&FeedStatus) -> bool,
) -> FeedStatus {
    let mut updates = manager.status_updates();
    tokio::time::timeout(Duration::from_secs(300), async {
        while let Some(status) = updates.next().await {
            if predicate(&status) {
                return status;
            }
        }
        panic!("status stream ended");
    })
    .await
    .expect("status never matched")
}

fn drain(attempts: &mut mpsc::UnboundedReceiver<Instant>) -> usize {
    let mut count = 0;
    while attempts.try_recv().is_ok() {
        count += 1;
    }
    count
}

fn assert_gap(earlier: Instant, later: Instant, expected_ms: u64) {
    let gap = later.duration_since(earlier);
    let expected = Duration::from_millis(expected_ms);
    assert!(
        gap >= expected && gap < expected + Duration::from_millis(5),
        "expected ~{:?} between attempts, got {:?}",
        expected,
        gap
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_then_holds_at_cap() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let manager = manager(&connector);

    manager.connect();

    let mut times = Vec::new();
    for _ in 0..8 {
        times.push(attempts.recv().await.expect("attempt"));
    }

    let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
    for (window, expected_ms) in times.windows(2).zip(expected) {
        assert_gap(window[0], window[1], expected_ms);
    }

    let status = wait_for(&manager, |s| s.state == ConnectionState::Reconnecting).await;
    assert_eq!(status.retry_count, 8);
    assert!(!status.connected);
    assert!(status.last_error.unwrap().contains("relay offline"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_the_pending_retry() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let manager = manager(&connector);

    manager.connect();
    attempts.recv().await.expect("first attempt");
    attempts.recv().await.expect("second attempt");
    wait_for(&manager, |s| s.state == ConnectionState::Reconnecting).await;

    manager.disconnect();
    manager.disconnect();

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(drain(&mut attempts), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.retry_count(), 0);

    manager.connect();
    attempts.recv().await.expect("attempt after explicit connect");
}

#[tokio::test(start_paused = true)]
async fn open_sends_handshake_and_resets_retries() {
    let (connector, mut attempts) = ScriptedConnector::new();
    connector.refuse_next("warming up");
    connector.refuse_next("warming up");
    let _relay = connector.accept_next();
    let manager = manager(&connector);

    manager.connect();
    let status = wait_for(&manager, |s| s.connected).await;

    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.retry_count, 0);
    assert_eq!(status.last_error, None);
    assert_eq!(connector.sent(), vec!["REQUEST_DATA".to_string()]);

    let first = attempts.recv().await.unwrap();
    let second = attempts.recv().await.unwrap();
    let third = attempts.recv().await.unwrap();
    assert_gap(first, second, 1_000);
    assert_gap(second, third, 2_000);
}

#[tokio::test(start_paused = true)]
async fn bad_frames_keep_the_last_snapshot() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let relay = connector.accept_next();
    let manager = manager(&connector);
    let mut snapshots = manager.snapshots(UpdateRate::Native);

    manager.connect();
    relay.frame(&sample_frame(3));
    let first = snapshots.next().await.expect("snapshot");
    assert_eq!(first.active_drivers, 3);

    relay.frame("PING");
    relay.frame(r#"{"heartbeat":true}"#);
    relay.error("checksum glitch");
    let status = wait_for(&manager, |s| s.last_error.is_some()).await;

    assert!(status.last_error.unwrap().contains("checksum glitch"));
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(Arc::ptr_eq(&first, &manager.latest_snapshot().unwrap()));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(drain(&mut attempts), 1);
}

#[tokio::test(start_paused = true)]
async fn error_then_close_schedules_one_retry() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let relay = connector.accept_next();
    let manager = manager(&connector);

    manager.connect();
    wait_for(&manager, |s| s.connected).await;
    let opened = attempts.recv().await.unwrap();

    relay.error("socket reset");
    relay.close();

    let status = wait_for(&manager, |s| s.state == ConnectionState::Reconnecting).await;
    assert_eq!(status.retry_count, 1);
    assert!(status.last_error.unwrap().contains("socket reset"));

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let retry = attempts.recv().await.unwrap();
    let second_retry = attempts.recv().await.unwrap();
    assert_gap(opened, retry, 1_000);
    assert_gap(retry, second_retry, 2_000);
    assert_eq!(drain(&mut attempts), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_is_a_noop_while_live() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let _relay = connector.accept_next();
    let manager = manager(&connector);

    manager.connect();
    manager.connect();
    wait_for(&manager, |s| s.connected).await;
    manager.connect();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(drain(&mut attempts), 1);
    assert_eq!(connector.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_while_reconnecting_retries_now() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let manager = manager(&connector);

    manager.connect();
    let first = attempts.recv().await.unwrap();
    wait_for(&manager, |s| s.state == ConnectionState::Reconnecting).await;
    assert_eq!(manager.retry_count(), 1);

    manager.connect();
    let immediate = attempts.recv().await.unwrap();
    assert_eq!(immediate, first);

    let status = wait_for(&manager, |s| s.retry_count == 2).await;
    assert_eq!(status.state, ConnectionState::Reconnecting);

    let next = attempts.recv().await.unwrap();
    assert_gap(immediate, next, 2_000);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_manager_stops_reconnects() {
    let (connector, mut attempts) = ScriptedConnector::new();
    let manager = manager(&connector);

    manager.connect();
    attempts.recv().await.unwrap();
    wait_for(&manager, |s| s.state == ConnectionState::Reconnecting).await;
    drop(manager);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(drain(&mut attempts), 0);
}

#[tokio::test(start_paused = true)]
async fn snapshots_survive_reconnects() {
    let (connector, _attempts) = ScriptedConnector::new();
    let relay = connector.accept_next();
    let second_relay = connector.accept_next();
    let manager = manager(&connector);
    let mut snapshots = manager.snapshots(UpdateRate::Native);

    manager.connect();
    relay.frame(&sample_frame(2));
    assert_eq!(snapshots.next().await.unwrap().active_drivers, 2);

    relay.close();
    wait_for(&manager, |s| s.state == ConnectionState::Reconnecting).await;
    assert_eq!(manager.latest_snapshot().unwrap().active_drivers, 2);

    wait_for(&manager, |s| s.connected).await;
    second_relay.frame(&sample_frame(5));
    assert_eq!(snapshots.next().await.unwrap().active_drivers, 5);
    assert_eq!(connector.sent(), vec!["REQUEST_DATA".to_string(), "REQUEST_DATA".to_string()]);
}

#[tokio::test]
async fn fresh_manager_is_idle() {
    let (connector, _attempts) = ScriptedConnector::new();
    let manager = manager(&connector);

    assert_eq!(manager.status(), FeedStatus::default());
    assert!(!manager.is_connected());
    assert!(manager.latest_snapshot().is_none());
    assert!(manager.last_error().is_none());
    assert_eq!(manager.endpoint().address(), "localhost:8080");
}
