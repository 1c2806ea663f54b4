//! End-to-end tests for the connection manager against the in-memory platform.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use serial_link_core::{ACK_BYTE, BaudRate, PortState, SerialMessage};
use serial_link_session::{
    ConnectionManager, ManagerError,
    platform::{MemoryPlatform, MemoryPortHandle},
};
use tokio::sync::mpsc;
use tokio_test::{assert_pending, assert_ready};

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (ConnectionManager<MemoryPlatform>, MemoryPortHandle) {
    let platform = MemoryPlatform::new("mem0");
    let handle = platform.handle();
    (ConnectionManager::new(platform), handle)
}

fn collect(manager: &ConnectionManager<MemoryPlatform>) -> mpsc::UnboundedReceiver<SerialMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = manager.subscribe(move |m| {
        let _ = tx.send(m.clone());
    });
    rx
}

async fn next_value(rx: &mut mpsc::UnboundedReceiver<SerialMessage>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscriber channel closed")
        .value
}

async fn wait_for_state(manager: &ConnectionManager<MemoryPlatform>, state: PortState) {
    let mut states = manager.watch_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for state")
        .unwrap();
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_frames_delivered_and_acknowledged() {
    let (manager, handle) = setup();
    let mut rx = collect(&manager);

    assert!(manager.connect().await);
    assert_eq!(manager.state(), PortState::Open);

    handle.push("noise<AB>junk<CD>");

    assert_eq!(next_value(&mut rx).await, "AB");
    assert_eq!(next_value(&mut rx).await, "CD");
    handle.wait_for_writes(2).await;
    assert_eq!(handle.writes(), vec![vec![ACK_BYTE], vec![ACK_BYTE]]);

    manager.disconnect().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_second_start_discards_partial_frame() {
    let (manager, handle) = setup();
    let mut rx = collect(&manager);
    assert!(manager.connect().await);

    handle.push("<AB");
    handle.push("<CD>");

    assert_eq!(next_value(&mut rx).await, "CD");
    handle.wait_for_writes(1).await;
    assert_eq!(handle.writes().len(), 1);
}

#[tokio::test]
async fn test_ack_written_before_next_frame_is_delivered() {
    let (manager, handle) = setup();
    let acks_seen = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&acks_seen);
    let probe = handle.clone();
    let _ = manager.subscribe(move |_| {
        seen.lock().unwrap().push(probe.writes().len());
    });

    assert!(manager.connect().await);
    handle.push("<1><2><3>");
    handle.wait_for_writes(3).await;

    // Frame N is delivered after exactly N - 1 acknowledgments.
    assert_eq!(*acks_seen.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_connect_when_not_closed_is_noop() {
    let (manager, handle) = setup();

    assert!(manager.connect().await);
    assert!(!manager.connect().await);
    assert!(matches!(
        manager.try_connect().await,
        Err(ManagerError::InvalidState(PortState::Open))
    ));
    assert_eq!(manager.state(), PortState::Open);
    assert_eq!(handle.open_count(), 1);
}

#[tokio::test]
async fn test_concurrent_connects_open_once() {
    let (manager, handle) = setup();

    let (a, b) = tokio::join!(manager.connect(), manager.connect());

    assert!(a ^ b);
    assert_eq!(manager.state(), PortState::Open);
    assert_eq!(handle.open_count(), 1);
}

#[tokio::test]
async fn test_selection_failure_reverts_to_closed() {
    let platform = MemoryPlatform::new("mem0");
    platform.set_fail_selection(true);
    let manager = ConnectionManager::new(platform);

    assert!(!manager.connect().await);
    assert_eq!(manager.state(), PortState::Closed);
    assert!(matches!(
        manager.try_connect().await,
        Err(ManagerError::Selection(_))
    ));
}

#[tokio::test]
async fn test_open_failure_reverts_to_closed() {
    let (manager, handle) = setup();
    handle.set_fail_open(true);

    assert!(matches!(
        manager.try_connect().await,
        Err(ManagerError::Open(_))
    ));
    assert_eq!(manager.state(), PortState::Closed);

    handle.set_fail_open(false);
    assert!(manager.connect().await);
}

#[tokio::test]
async fn test_disconnect_releases_everything() {
    let (manager, handle) = setup();
    assert!(manager.connect().await);
    wait_until(|| handle.reader_locked()).await;

    manager.disconnect().await;

    assert_eq!(manager.state(), PortState::Closed);
    assert!(!handle.is_open());
    assert!(!handle.reader_locked());
    assert_eq!(handle.close_count(), 1);
    assert!(!manager.send(b"late").await);
    assert!(handle.writes().is_empty());
}

#[tokio::test]
async fn test_disconnect_when_closed_is_noop() {
    let (manager, handle) = setup();

    manager.disconnect().await;

    assert_eq!(manager.state(), PortState::Closed);
    assert_eq!(handle.close_count(), 0);
}

#[tokio::test]
async fn test_reconnect_starts_with_empty_buffer() {
    let (manager, handle) = setup();
    let mut rx = collect(&manager);

    assert!(manager.connect().await);
    handle.push("<AB><par");
    assert_eq!(next_value(&mut rx).await, "AB");
    manager.disconnect().await;

    assert!(manager.connect().await);
    handle.push("tial>");
    handle.push("<OK>");

    assert_eq!(next_value(&mut rx).await, "OK");
    assert_eq!(handle.open_count(), 2);
}

#[tokio::test]
async fn test_baud_rate_only_changes_while_closed() {
    let (manager, handle) = setup();

    assert!(manager.set_baud_rate(BaudRate::B9600));
    assert!(manager.connect().await);
    assert_eq!(handle.opened_with(), Some(BaudRate::B9600));

    assert!(!manager.set_baud_rate(BaudRate::B115200));
    assert_eq!(manager.baud_rate(), BaudRate::B9600);

    manager.disconnect().await;
    assert!(manager.set_baud_rate(BaudRate::B115200));
    assert!(manager.connect().await);
    assert_eq!(handle.opened_with(), Some(BaudRate::B115200));
}

#[tokio::test]
async fn test_send_writes_bytes() {
    let (manager, handle) = setup();
    assert!(!manager.send(b"hi").await);
    assert!(matches!(
        manager.try_send(b"hi").await,
        Err(ManagerError::NotOpen)
    ));

    assert!(manager.connect().await);
    assert!(manager.send(b"hi").await);
    assert_eq!(handle.writes(), vec![b"hi".to_vec()]);
}

#[tokio::test]
async fn test_write_failure_keeps_session_open() {
    let (manager, handle) = setup();
    assert!(manager.connect().await);
    handle.set_fail_writes(true);

    assert!(!manager.send(b"x").await);
    assert!(matches!(
        manager.try_send(b"x").await,
        Err(ManagerError::Write(_))
    ));
    assert_eq!(manager.state(), PortState::Open);

    handle.set_fail_writes(false);
    assert!(manager.send(b"y").await);
}

#[tokio::test]
async fn test_read_error_ends_loop_but_session_stays_open() {
    let (manager, handle) = setup();
    let mut rx = collect(&manager);
    assert!(manager.connect().await);

    handle.push("<AB>");
    assert_eq!(next_value(&mut rx).await, "AB");
    handle.push_error("framing error");

    wait_until(|| !handle.reader_locked()).await;
    assert_eq!(manager.state(), PortState::Open);
    assert!(manager.send(b"still here").await);

    manager.disconnect().await;
    assert_eq!(manager.state(), PortState::Closed);
}

#[tokio::test]
async fn test_end_of_stream_releases_reader() {
    let (manager, handle) = setup();
    assert!(manager.connect().await);

    handle.push("<AB>");
    handle.end_stream();

    handle.wait_for_writes(1).await;
    wait_until(|| !handle.reader_locked()).await;
    assert_eq!(manager.state(), PortState::Open);
}

#[tokio::test]
async fn test_hardware_disconnect_closes_session() {
    let (manager, handle) = setup();
    assert!(manager.connect().await);
    wait_until(|| handle.reader_locked()).await;

    handle.unplug();
    wait_for_state(&manager, PortState::Closed).await;

    assert!(!handle.reader_locked());
    assert!(!handle.is_open());
    assert!(!manager.send(b"x").await);

    // Selection fails until the device is back.
    assert!(!manager.connect().await);
    handle.replug();
    assert!(manager.connect().await);
}

#[tokio::test]
async fn test_manual_and_hardware_disconnect_do_not_race() {
    let (manager, handle) = setup();
    assert!(manager.connect().await);

    handle.unplug();
    tokio::join!(manager.disconnect(), manager.handle_port_lost());
    wait_for_state(&manager, PortState::Closed).await;

    assert_eq!(handle.close_count(), 1);
    assert!(!handle.reader_locked());
}

#[tokio::test]
async fn test_unsubscribed_callback_gets_nothing_more() {
    let (manager, handle) = setup();
    let count = Arc::new(Mutex::new(0));

    let counter = Arc::clone(&count);
    let token = manager.subscribe(move |_| {
        *counter.lock().unwrap() += 1;
    });
    let mut rx = collect(&manager);

    assert!(manager.connect().await);
    handle.push("<AB>");
    assert_eq!(next_value(&mut rx).await, "AB");

    token.unsubscribe();
    token.unsubscribe();
    handle.push("<CD>");
    assert_eq!(next_value(&mut rx).await, "CD");

    assert_eq!(*count.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_message_stream() {
    let (manager, handle) = setup();
    let mut stream = manager.message_stream();
    assert!(manager.connect().await);

    handle.push("<hello>");

    let msg = tokio::time::timeout(WAIT, stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.value, "hello");
    assert!(msg.timestamp > 0);
}

#[tokio::test]
async fn test_writes_wait_until_recorded() {
    let (manager, handle) = setup();
    assert!(manager.connect().await);

    let mut waiting = tokio_test::task::spawn(handle.wait_for_writes(1));
    assert_pending!(waiting.poll());

    assert!(manager.send(&[ACK_BYTE]).await);
    assert!(waiting.is_woken());
    assert_ready!(waiting.poll());
}
