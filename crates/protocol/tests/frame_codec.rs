//! Integration tests for resumable frame I/O
//!
//! Simulates non-blocking sockets that accept or deliver only a few bytes per
//! call, interleaved with `WouldBlock`, and checks that frames survive intact.
//!
//! Run with: `cargo test -p protocol --test frame_codec`

use protocol::{
    CommandHeader, FRAME_HEADER_SIZE, Frame, FrameReader, FrameWriter, MAX_PAYLOAD_SIZE,
    ProtocolError, ReadOutcome, WriteOutcome, encode_command, split_command,
};
use rand::Rng;
use std::io::{self, ErrorKind, Read, Write};

/// Byte pipe that moves at most `chunk` bytes per call and reports
/// `WouldBlock` every other call
struct TrickleStream {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    stalled: bool,
}

impl TrickleStream {
    fn new(chunk: usize) -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            chunk,
            stalled: false,
        }
    }

    fn toggle_stall(&mut self) -> bool {
        self.stalled = !self.stalled;
        self.stalled
    }
}

impl Write for TrickleStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.toggle_stall() {
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.chunk);
        self.data.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for TrickleStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.toggle_stall() {
            return Err(ErrorKind::WouldBlock.into());
        }
        let remaining = self.data.len() - self.pos;
        if remaining == 0 {
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.chunk).min(remaining);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn pump_write(stream: &mut TrickleStream, frame: &Frame) -> usize {
    let mut writer = FrameWriter::new();
    let mut calls = 0;
    loop {
        calls += 1;
        match writer.poll_write(stream, frame).expect("write failed") {
            WriteOutcome::Complete => return calls,
            WriteOutcome::Partial | WriteOutcome::WouldBlock => {}
            other => panic!("unexpected write outcome {:?}", other),
        }
    }
}

fn pump_read(stream: &mut TrickleStream) -> Frame {
    let mut reader = FrameReader::new();
    let mut frame = Frame::new();
    loop {
        match reader.poll_read(stream, &mut frame).expect("read failed") {
            ReadOutcome::Complete => return frame,
            ReadOutcome::Partial | ReadOutcome::WouldBlock => {}
            other => panic!("unexpected read outcome {:?}", other),
        }
    }
}

// ============================================================================
// Round-trip under partial I/O
// ============================================================================

#[test]
fn test_byte_by_byte_round_trip() {
    for size in [1usize, 2, 3, 4, 5, 63, 64, 65, 511, MAX_PAYLOAD_SIZE] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 + 3) as u8).collect();
        let frame = Frame::from_payload(&payload).unwrap();

        let mut stream = TrickleStream::new(1);
        let calls = pump_write(&mut stream, &frame);
        // One successful call per byte, one WouldBlock before each
        assert_eq!(calls, 2 * (FRAME_HEADER_SIZE + size));

        let received = pump_read(&mut stream);
        assert_eq!(received.payload_size() as usize, size);
        assert_eq!(received.payload(), &payload[..]);
        assert_eq!(received.as_wire(), frame.as_wire());
    }
}

#[test]
fn test_random_chunk_round_trip() {
    let mut rng = rand::rng();

    for _ in 0..50 {
        let size = rng.random_range(1..=MAX_PAYLOAD_SIZE);
        let chunk = rng.random_range(1..=size + FRAME_HEADER_SIZE);
        let payload: Vec<u8> = (0..size).map(|_| rng.random()).collect();
        let frame = Frame::from_payload(&payload).unwrap();

        let mut stream = TrickleStream::new(chunk);
        pump_write(&mut stream, &frame);
        let received = pump_read(&mut stream);

        assert_eq!(received.payload(), &payload[..]);
    }
}

#[test]
fn test_back_to_back_frames_keep_order() {
    let mut stream = TrickleStream::new(3);
    let first = Frame::from_payload(&[1, 1, 1, 1, 1]).unwrap();
    let second = Frame::from_payload(&[2, 2]).unwrap();
    pump_write(&mut stream, &first);
    pump_write(&mut stream, &second);

    assert_eq!(pump_read(&mut stream).payload(), first.payload());
    assert_eq!(pump_read(&mut stream).payload(), second.payload());
}

// ============================================================================
// Header validation
// ============================================================================

#[test]
fn test_invalid_size_detected_after_split_header() {
    for size in [0u32, MAX_PAYLOAD_SIZE as u32 + 1, u32::MAX] {
        let mut stream = TrickleStream::new(1);
        stream.data.extend_from_slice(&size.to_ne_bytes());

        let mut reader = FrameReader::new();
        let mut frame = Frame::new();
        let err = loop {
            match reader.poll_read(&mut stream, &mut frame) {
                Ok(ReadOutcome::Partial) | Ok(ReadOutcome::WouldBlock) => continue,
                Ok(other) => panic!("unexpected outcome {:?}", other),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ProtocolError::InvalidPayloadSize { .. }));
        assert_eq!(reader.bytes_read(), FRAME_HEADER_SIZE);
    }
}

#[test]
fn test_command_inside_frame() {
    let payload = encode_command(CommandHeader::read_write(), &[0xDE, 0xAD]);
    let frame = Frame::from_payload(&payload).unwrap();

    let mut stream = TrickleStream::new(2);
    pump_write(&mut stream, &frame);
    let received = pump_read(&mut stream);

    let (header, body) = split_command(received.payload()).unwrap();
    assert!(!header.is_write_only());
    assert_eq!(body, &[0xDE, 0xAD]);
}
