//! Ethernet side of the frame relay
//!
//! Serves one TCP client at a time. Every tick the worker makes a little
//! progress in each direction without blocking:
//!
//! 1. accept a client if none is connected
//! 2. pick up the next reply frame if nothing is being written
//! 3. write what the socket accepts of the current reply frame
//! 4. take an inbound frame slot if the pool has one
//! 5. read what the socket offers into the current inbound frame
//!
//! [`FrameReader`] and [`FrameWriter`] keep the byte counters so partial
//! reads and writes resume on the next tick.

use common::{EthRelay, FramePool, LinkStatus, PooledFrame};
use protocol::{FrameReader, FrameWriter, ProtocolError, ReadOutcome, WriteOutcome};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub struct EthernetWorker {
    listener: TcpListener,
    client: Option<TcpStream>,
    relay: EthRelay,
    inbound: FramePool,
    link: Arc<LinkStatus>,
    incoming: Option<PooledFrame>,
    reader: FrameReader,
    outgoing: Option<PooledFrame>,
    writer: FrameWriter,
}

impl EthernetWorker {
    /// Bind the server socket
    pub fn bind(
        addr: SocketAddr,
        relay: EthRelay,
        inbound: FramePool,
        link: Arc<LinkStatus>,
    ) -> common::Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| common::Error::Network(format!("bind {}: {}", addr, e)))?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            client: None,
            relay,
            inbound,
            link,
            incoming: None,
            reader: FrameReader::new(),
            outgoing: None,
            writer: FrameWriter::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn is_client_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Tick until `shutdown` is set or a fatal error occurs
    ///
    /// The relay is closed on return so the USB worker wakes up.
    pub fn run(mut self, tick: Duration, shutdown: Arc<AtomicBool>) -> common::Result<()> {
        match self.local_addr() {
            Ok(addr) => info!("Ethernet worker listening on {}", addr),
            Err(e) => warn!("Ethernet worker listening (address unknown: {})", e),
        }

        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.tick() {
                if shutdown.load(Ordering::Relaxed) {
                    break Ok(());
                }
                error!("Ethernet worker failed: {}", e);
                break Err(e);
            }
            thread::sleep(tick);
        };

        self.close_client();
        // Free queued replies so a USB worker waiting on the outbound pool wakes
        while let Ok(Some(_)) = self.relay.try_recv_reply() {}
        self.relay.close();
        info!("Ethernet worker stopped");
        result
    }

    /// Make one round of progress on the socket
    pub fn tick(&mut self) -> common::Result<()> {
        if self.client.is_none() && !self.accept()? {
            return Ok(());
        }
        self.write_step()?;
        self.read_step()
    }

    fn accept(&mut self) -> common::Result<bool> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                info!("Client connected from {}", peer);
                self.reader.reset();
                self.writer.reset();
                self.client = Some(stream);
                self.link.set_ethernet_connected(true);
                Ok(true)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(common::Error::Network(format!("accept: {}", e))),
        }
    }

    fn write_step(&mut self) -> common::Result<()> {
        if self.outgoing.is_none() {
            if let Some(frame) = self.relay.try_recv_reply()? {
                self.writer.reset();
                self.outgoing = Some(frame);
            }
        }

        let (Some(frame), Some(client)) = (self.outgoing.as_ref(), self.client.as_mut()) else {
            return Ok(());
        };

        match self.writer.poll_write(client, frame)? {
            WriteOutcome::Complete => {
                trace!("Reply frame of {} bytes written", frame.wire_len());
                self.outgoing = None;
            }
            WriteOutcome::Partial | WriteOutcome::WouldBlock => {}
            WriteOutcome::EndOfStream | WriteOutcome::Disconnected => {
                info!("Client disconnected while writing");
                self.close_client();
            }
        }
        Ok(())
    }

    fn read_step(&mut self) -> common::Result<()> {
        if self.incoming.is_none() {
            let Some(frame) = self.inbound.try_alloc() else {
                return Ok(());
            };
            self.reader.reset();
            self.incoming = Some(frame);
        }

        let (Some(frame), Some(client)) = (self.incoming.as_mut(), self.client.as_mut()) else {
            return Ok(());
        };

        match self.reader.poll_read(client, frame) {
            Ok(ReadOutcome::Complete) => {
                if let Some(frame) = self.incoming.take() {
                    trace!("Request frame of {} bytes read", frame.wire_len());
                    self.relay.send_request(frame)?;
                }
            }
            Ok(ReadOutcome::Partial | ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::EndOfStream | ReadOutcome::Disconnected) => {
                info!("Client disconnected");
                self.close_client();
            }
            Err(e @ ProtocolError::InvalidPayloadSize { .. }) => {
                warn!("Closing client: {}", e);
                self.close_client();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Drop the client and any half-transferred frames
    fn close_client(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.shutdown(Shutdown::Both);
            self.link.set_ethernet_connected(false);
        }
        self.incoming = None;
        self.outgoing = None;
        self.reader.reset();
        self.writer.reset();
    }
}
