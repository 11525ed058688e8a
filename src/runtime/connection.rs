//! Per-connection state machine.
//!
//! A slot owns the socket, a read/write buffer pair, and an ordered pair of
//! write segments: header bytes staged in the write buffer, then an optional
//! externally-owned payload span with its own consumed offset. Partial writes
//! advance both as a unit, so a resumed write never resends or skips a byte.
//!
//! Slots are handed to worker threads under the exclusive-dispatch
//! discipline: connections are registered one-shot, so at most one worker
//! holds a slot between re-arm points. The mutex around each slot is
//! therefore uncontended in steady state.

use crate::protocol::{Consume, Processor};
use crate::runtime::buffer::IoBuffer;
use crate::runtime::notifier::Interest;
use bytes::Bytes;
use std::io::{self, IoSlice, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Bytes of backlog below which a level-triggered write yields back to the
/// notifier instead of spinning. Policy, not contract.
const WRITE_SPIN_THRESHOLD: usize = 10 * 1024;

/// Lifecycle of a connection.
///
/// `ArmedRead ⇄ DispatchedRead → (ArmedWrite ⇄ DispatchedWrite) → Closed`;
/// `Closed` is terminal and reachable from anywhere on error, EOF, timeout,
/// or a non-keep-alive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Read interest armed in the notifier.
    ArmedRead,
    /// A read task holds this slot.
    DispatchedRead,
    /// Write interest armed in the notifier.
    ArmedWrite,
    /// A write task holds this slot.
    DispatchedWrite,
    /// Deregistered; queued tasks must become no-ops.
    Closed,
}

/// Result of draining the socket into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes received (possibly zero if the socket was already drained).
    Received(usize),
    /// Orderly EOF from the peer.
    PeerClosed,
}

/// Result of one write turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything (header and payload) went out.
    Complete,
    /// Bytes remain; write interest must be re-armed.
    Pending,
}

/// A single client connection.
pub struct ConnectionSlot {
    stream: TcpStream,
    peer: SocketAddr,
    pub state: ConnState,
    read_buf: IoBuffer,
    write_buf: IoBuffer,
    payload: Option<Bytes>,
    payload_off: usize,
    keep_alive: bool,
    interest: Interest,
    processor: Box<dyn Processor>,
}

impl ConnectionSlot {
    pub fn new(stream: TcpStream, peer: SocketAddr, processor: Box<dyn Processor>) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::ArmedRead,
            read_buf: IoBuffer::new(),
            write_buf: IoBuffer::new(),
            payload: None,
            payload_off: 0,
            keep_alive: false,
            interest: Interest::empty(),
            processor,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Interest mask currently armed in the notifier.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    pub fn read_buffer(&mut self) -> &mut IoBuffer {
        &mut self.read_buf
    }

    /// Drain the socket into the read buffer.
    ///
    /// Loops until would-block under edge triggering (the kernel will not
    /// re-report), reads once under level triggering. Hard errors bubble.
    pub fn read_from_socket(&mut self, edge: bool) -> io::Result<ReadOutcome> {
        let fd = self.fd();
        let mut total = 0;
        loop {
            match self.read_buf.read_from(fd) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(n) => {
                    total += n;
                    if !edge {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Received(total))
    }

    /// Run the processor over buffered input. Returns true when a response
    /// was serialized and write interest should be armed.
    pub fn process(&mut self) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }
        match self.processor.consume(&mut self.read_buf) {
            Consume::NeedMore => false,
            Consume::Ready => {
                let resp = self.processor.serialize(&mut self.write_buf);
                self.keep_alive = resp.keep_alive;
                self.payload = resp.payload;
                self.payload_off = 0;
                true
            }
            Consume::Malformed => {
                let resp = self.processor.serialize(&mut self.write_buf);
                self.keep_alive = false;
                self.payload = resp.payload;
                self.payload_off = 0;
                true
            }
        }
    }

    /// Bytes still owed to the peer across both segments.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.payload_remaining()
    }

    fn payload_remaining(&self) -> usize {
        self.payload
            .as_ref()
            .map_or(0, |p| p.len() - self.payload_off)
    }

    /// One write turn: vectored writes across the segment list, resuming at
    /// the per-segment offsets.
    ///
    /// Loops while edge-triggered, or while the remaining backlog exceeds
    /// `WRITE_SPIN_THRESHOLD` under level triggering (bounding one turn's
    /// work). Would-block yields `Pending`; the caller re-arms writability.
    pub fn write_to_socket(&mut self, edge: bool) -> io::Result<WriteOutcome> {
        loop {
            let n = {
                let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(2);
                if self.write_buf.readable() > 0 {
                    iovs.push(IoSlice::new(self.write_buf.peek()));
                }
                if let Some(payload) = &self.payload {
                    if self.payload_off < payload.len() {
                        iovs.push(IoSlice::new(&payload[self.payload_off..]));
                    }
                }
                if iovs.is_empty() {
                    return Ok(WriteOutcome::Complete);
                }
                match (&self.stream).write_vectored(&iovs) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned zero with bytes remaining",
                        ))
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(WriteOutcome::Pending)
                    }
                    Err(e) => return Err(e),
                }
            };

            self.advance_write(n);

            if self.to_write_bytes() == 0 {
                return Ok(WriteOutcome::Complete);
            }
            if !edge && self.to_write_bytes() <= WRITE_SPIN_THRESHOLD {
                return Ok(WriteOutcome::Pending);
            }
        }
    }

    /// Advance both segments past `n` written bytes: header first, spillover
    /// into the payload offset.
    pub(crate) fn advance_write(&mut self, n: usize) {
        let header = self.write_buf.readable();
        if n >= header {
            self.write_buf.retrieve(header);
            self.payload_off += n - header;
            debug_assert!(self.payload_off <= self.payload.as_ref().map_or(0, |p| p.len()));
        } else {
            self.write_buf.retrieve(n);
        }
    }

    /// Clear response state for the next keep-alive request. Unconsumed
    /// read-buffer bytes survive (pipelined requests).
    pub fn reset_for_next(&mut self) {
        self.write_buf.retrieve_all();
        self.payload = None;
        self.payload_off = 0;
    }

    /// Stage a response directly, bypassing the processor.
    #[cfg(test)]
    pub(crate) fn stage_response(&mut self, header: &[u8], payload: Option<Bytes>) {
        self.write_buf.append(header);
        self.payload = payload;
        self.payload_off = 0;
    }
}
