//! Host Channel Integration Tests
//!
//! Tests for the event channel between host-layer threads and an async
//! consumer, driven through the simulated host layer.
//!
//! # Test Scenarios
//! - Event flow from plain threads into a Tokio consumer
//! - Ordering of arrival, completion and removal events
//! - Backpressure on a full queue
//!
//! Run with: `cargo test -p common --test host_channel_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockHost, create_mock_bulk_data, create_mock_vendor_arrival,
    with_timeout,
};
use common::{
    DeviceAddress, Direction, HostEvent, Transfer, TransferKind, TransferStatus, TransferTag,
    UsbHost, create_host_channel,
};
use std::thread;
use std::time::Duration;

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_events_from_many_threads() {
    let (tx, rx) = create_host_channel(8);

    let producers: Vec<_> = (1..=4u8)
        .map(|n| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..25u8 {
                    tx.send_blocking(HostEvent::DeviceLeft(DeviceAddress::new(n, i)))
                        .unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let mut per_bus = [0u8; 5];
    for _ in 0..100 {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        let HostEvent::DeviceLeft(addr) = event else {
            panic!("unexpected event: {:?}", event);
        };
        // Each producer's events stay in order
        assert_eq!(addr.address, per_bus[addr.bus as usize]);
        per_bus[addr.bus as usize] += 1;
    }

    for producer in producers {
        producer.join().unwrap();
    }
    assert!(rx.recv().await.is_err());
}

#[tokio::test]
async fn test_mock_host_event_order() {
    let host = MockHost::new();
    let (tx, rx) = create_host_channel(16);
    host.register_client(tx).unwrap();

    let addr = DeviceAddress::new(2, 3);
    host.plug(create_mock_vendor_arrival(addr, 0x1234, 0x5678));
    let mut link = host.open_interface(addr, &[0]).unwrap();
    link.submit(Transfer {
        tag: TransferTag(5),
        endpoint: 0x01,
        kind: TransferKind::Bulk,
        buffer: create_mock_bulk_data(64),
        length: 64,
    })
    .unwrap();
    assert_eq!(host.complete_out().map(|d| d.len()), Some(64));
    host.unplug(addr);

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        kinds.push(match event {
            HostEvent::DeviceArrived(dev) => {
                assert_eq!(dev.address, addr);
                "arrived"
            }
            HostEvent::TransferCompleted(c) => {
                assert_eq!(c.tag, TransferTag(5));
                assert_eq!(c.status, TransferStatus::Completed);
                "completed"
            }
            HostEvent::DeviceLeft(left) => {
                assert_eq!(left, addr);
                "left"
            }
        });
    }
    assert_eq!(kinds, vec!["arrived", "completed", "left"]);

    link.release();
    host.deregister_client().unwrap();
}

#[tokio::test]
async fn test_cancel_reports_every_transfer() {
    let host = MockHost::new();
    let (tx, rx) = create_host_channel(16);
    host.register_client(tx).unwrap();

    let addr = DeviceAddress::new(1, 9);
    host.plug(create_mock_vendor_arrival(addr, 1, 2));
    let arrived = rx.recv().await.unwrap();
    assert!(matches!(arrived, HostEvent::DeviceArrived(_)));

    let mut link = host.open_interface(addr, &[0]).unwrap();
    for tag in 0..3 {
        link.submit(Transfer {
            tag: TransferTag(tag),
            endpoint: 0x81,
            kind: TransferKind::Bulk,
            buffer: vec![0; 64],
            length: 64,
        })
        .unwrap();
    }
    assert_eq!(host.pending_count(Direction::In), 3);

    link.cancel_all();
    let mut tags = Vec::new();
    for _ in 0..3 {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            HostEvent::TransferCompleted(c) => {
                assert_eq!(c.status, TransferStatus::Cancelled);
                tags.push(c.tag.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(tags, vec![0, 1, 2]);
    assert_eq!(host.pending_count(Direction::In), 0);
}

// ============================================================================
// Backpressure Tests
// ============================================================================

#[tokio::test]
async fn test_full_queue_blocks_producer() {
    let (tx, rx) = create_host_channel(1);
    tx.send_blocking(HostEvent::DeviceLeft(DeviceAddress::new(1, 1)))
        .unwrap();

    let producer = thread::spawn(move || {
        tx.send_blocking(HostEvent::DeviceLeft(DeviceAddress::new(1, 2)))
            .unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());

    let first = rx.recv().await.unwrap();
    assert!(matches!(first, HostEvent::DeviceLeft(a) if a.address == 1));
    let second = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert!(matches!(second, HostEvent::DeviceLeft(a) if a.address == 2));
    producer.join().unwrap();
}
