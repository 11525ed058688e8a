//! Growable scatter/gather byte buffer.
//!
//! `IoBuffer` keeps independent read and write cursors over a contiguous
//! backing store. The region before the read cursor (already consumed) is
//! reclaimed by compaction before the buffer ever grows, which amortizes
//! allocation under steady read/write cycling.
//!
//! `read_from` performs a two-segment vectored read: the buffer's own
//! writable tail plus a fixed stack scratch region. If the tail fills, the
//! scratch overflow is appended (growing the buffer), so a single call never
//! loses data even when the buffer was nearly full.

use std::io;
use std::os::unix::io::RawFd;

/// Default initial capacity for connection buffers.
pub const INITIAL_CAPACITY: usize = 1024;

/// Scratch region size for overflow reads.
const SCRATCH_SIZE: usize = 65536;

/// Byte buffer with read/write cursors.
///
/// Invariant: `0 <= read_pos <= write_pos <= capacity`.
pub struct IoBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl IoBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Bytes available to read.
    pub fn readable(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Bytes available to write at the tail.
    pub fn writable(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Reclaimable space in front of the read cursor.
    pub fn prependable(&self) -> usize {
        self.read_pos
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Read-only view of the unread region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Advance the read cursor by `len` consumed bytes.
    ///
    /// # Panics
    /// Panics if `len` exceeds the readable region; consuming bytes that were
    /// never written indicates cursor desynchronization in the caller.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable(), "retrieve past readable region");
        self.read_pos += len;
    }

    /// Reset both cursors, discarding all unread data.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Drain the unread region into an owned vector.
    pub fn retrieve_all_to_vec(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.retrieve_all();
        out
    }

    /// Copy `data` into the buffer, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Make room for at least `len` writable bytes.
    ///
    /// Grows the backing store only when the writable tail plus the
    /// prependable head cannot hold `len`; otherwise shifts the unread region
    /// to offset 0, reclaiming the head without allocating.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() >= len {
            return;
        }
        if self.writable() + self.prependable() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
        debug_assert!(self.writable() >= len);
    }

    /// Vectored read from `fd` into the writable tail plus a scratch region.
    ///
    /// Returns the number of bytes read, `Ok(0)` on orderly EOF, or the
    /// underlying error (`ErrorKind::WouldBlock` for a drained socket).
    pub fn read_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let writable = self.writable();
        let iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.write_pos) } as *mut _,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut _,
                iov_len: scratch.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            // Tail filled completely; the remainder landed in scratch.
            self.write_pos = self.buf.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`, advancing the read cursor by the
    /// bytes actually written.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable();
        let n = unsafe {
            libc::write(
                fd,
                self.buf.as_ptr().add(self.read_pos) as *const _,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += n as usize;
        Ok(n as usize)
    }
}

impl Default for IoBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn check_invariant(buf: &IoBuffer) {
        assert_eq!(
            buf.readable() + buf.writable() + buf.prependable(),
            buf.capacity()
        );
    }

    #[test]
    fn test_cursor_accounting() {
        let mut buf = IoBuffer::with_capacity(64);
        check_invariant(&buf);

        buf.append(b"hello world");
        assert_eq!(buf.readable(), 11);
        assert_eq!(buf.peek(), b"hello world");
        check_invariant(&buf);

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable(), 6);
        check_invariant(&buf);

        buf.retrieve_all();
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.prependable(), 0);
        check_invariant(&buf);
    }

    #[test]
    fn test_round_trip() {
        let mut buf = IoBuffer::new();
        let data: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        buf.append(&data);
        assert_eq!(buf.retrieve_all_to_vec(), data);
    }

    #[test]
    fn test_compaction_reclaims_head() {
        let mut buf = IoBuffer::with_capacity(16);
        buf.append(&[1u8; 12]);
        buf.retrieve(10);

        // 2 readable, 4 writable, 10 prependable. 8 more bytes fit only
        // after compaction; capacity must not change.
        let cap = buf.capacity();
        buf.append(&[2u8; 8]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.peek(), &[1, 1, 2, 2, 2, 2, 2, 2, 2, 2][..]);
        check_invariant(&buf);
    }

    #[test]
    fn test_growth_preserves_sequence() {
        // Append 100, retrieve 60, append 50: the survivors must be exactly
        // bytes [60, 160) of the logical write sequence, whether the second
        // append grew or compacted.
        let mut buf = IoBuffer::with_capacity(110);
        let first: Vec<u8> = (0..100u8).collect();
        let second: Vec<u8> = (100..150u8).collect();

        buf.append(&first);
        buf.retrieve(60);
        buf.append(&second);

        let expected: Vec<u8> = (60..150u8).collect();
        assert_eq!(buf.retrieve_all_to_vec(), expected);
    }

    #[test]
    #[should_panic(expected = "retrieve past readable region")]
    fn test_retrieve_past_end_panics() {
        let mut buf = IoBuffer::new();
        buf.append(b"abc");
        buf.retrieve(4);
    }

    #[test]
    fn test_read_from_socket_overflow_grows() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        // Buffer holds 8 writable bytes; the rest must flow through the
        // scratch region and grow the buffer without losing data.
        let mut buf = IoBuffer::with_capacity(8);
        let payload: Vec<u8> = (0..200u8).collect();
        tx.write_all(&payload).unwrap();

        let n = buf.read_from(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 200);
        assert_eq!(buf.peek(), &payload[..]);
    }

    #[test]
    fn test_read_from_would_block() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut buf = IoBuffer::new();
        let err = buf.read_from(rx.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_read_from_eof() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);

        let mut buf = IoBuffer::new();
        assert_eq!(buf.read_from(rx.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn test_write_to_socket() {
        let (tx, mut rx) = UnixStream::pair().unwrap();

        let mut buf = IoBuffer::new();
        buf.append(b"response bytes");
        let n = buf.write_to(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 14);
        assert_eq!(buf.readable(), 0);

        let mut out = vec![0u8; 14];
        rx.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"response bytes");
    }
}
