//! Relay plumbing integration tests
//!
//! Exercises the frame pools and relay queues together the way the Ethernet
//! and USB workers use them.
//!
//! # Test Scenarios
//! - FIFO order through the request and reply queues
//! - Slot ownership: every slot returns to its pool exactly once
//! - Backpressure when a pool or a queue is exhausted
//!
//! Run with: `cargo test -p common --test relay_pipeline_tests`

use common::{FramePool, create_relay_channels};
use std::thread;
use std::time::Duration;

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_requests_and_replies_keep_fifo_order() {
    let inbound = FramePool::new("inbound", 8).unwrap();
    let outbound = FramePool::new("outbound", 8).unwrap();
    let (eth, usb) = create_relay_channels(8);

    let usb_thread = {
        let outbound = outbound.clone();
        thread::spawn(move || {
            for _ in 0..8 {
                let request = usb.recv_request().unwrap();
                let mut reply = outbound.alloc_blocking().unwrap();
                reply.set_payload(request.payload()).unwrap();
                drop(request);
                usb.send_reply(reply).unwrap();
            }
            usb
        })
    };

    for i in 0..8u8 {
        let mut frame = inbound.try_alloc().unwrap();
        frame.set_payload(&[i]).unwrap();
        eth.send_request(frame).unwrap();
    }

    // Keep the USB side alive so the reply queue stays open
    let _usb = usb_thread.join().unwrap();

    for i in 0..8u8 {
        let reply = eth.try_recv_reply().unwrap().expect("reply missing");
        assert_eq!(reply.payload(), &[i]);
    }
    assert!(eth.try_recv_reply().unwrap().is_none());
    assert_eq!(inbound.free_space(), 8);
    assert_eq!(outbound.free_space(), 8);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_exhausted_pool_stalls_producer_without_losing_frames() {
    let inbound = FramePool::new("inbound", 2).unwrap();
    let (eth, usb) = create_relay_channels(4);

    let mut sent = 0u8;
    // Producer loop: only allocates while the pool has room
    for _ in 0..5 {
        if inbound.free_space() == 0 {
            continue;
        }
        let mut frame = inbound.try_alloc().unwrap();
        frame.set_payload(&[sent]).unwrap();
        eth.send_request(frame).unwrap();
        sent += 1;
    }
    assert_eq!(sent, 2);
    assert!(inbound.try_alloc().is_none());

    // Consumer frees one slot; producer resumes
    let first = usb.recv_request().unwrap();
    assert_eq!(first.payload(), &[0]);
    drop(first);
    assert_eq!(inbound.free_space(), 1);

    let mut frame = inbound.try_alloc().unwrap();
    frame.set_payload(&[sent]).unwrap();
    eth.send_request(frame).unwrap();

    assert_eq!(usb.recv_request().unwrap().payload(), &[1]);
    assert_eq!(usb.recv_request().unwrap().payload(), &[2]);
    assert_eq!(inbound.free_space(), 2);
}

#[test]
fn test_full_request_queue_blocks_sender() {
    let inbound = FramePool::new("inbound", 3).unwrap();
    let (eth, usb) = create_relay_channels(1);

    eth.send_request(inbound.try_alloc().unwrap()).unwrap();

    let sender = {
        let frame = inbound.try_alloc().unwrap();
        thread::spawn(move || {
            eth.send_request(frame).unwrap();
            eth
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!sender.is_finished());

    drop(usb.recv_request().unwrap());
    let eth = sender.join().unwrap();
    drop(usb.recv_request().unwrap());

    assert_eq!(inbound.free_space(), 3);
    eth.close();
    assert!(usb.is_closed());
}
