//! A growable byte buffer with separate read/write cursors, used for both the
//! inbound and outbound side of every connection.
//!
//! The layout keeps a small reserved region in front of the payload so that a
//! protocol layer can prepend a frame header without copying the body:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0            read cursor        write cursor          capacity
//! ```
//!
//! All methods run on the owning connection's loop thread; the type itself is
//! plain data and carries no synchronization.

use std::io::IoSliceMut;
use std::os::fd::AsFd;

use nix::sys::uio::readv;
use nix::unistd::write;

/// Bytes reserved in front of the payload for backward-written headers.
pub const CHEAP_PREPEND: usize = 8;
/// Initial payload capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the on-stack overflow region used by [Buffer::read_fd].
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with room for `initial` payload bytes before growing.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the read cursor, including the reserved
    /// prepend region.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Total size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// A view of the unread payload.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Advance the read cursor by `n`. Consuming everything (or more than is
    /// readable) resets both cursors to the prepend boundary.
    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Drop all unread payload and reset both cursors to the prepend boundary.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consume `n` bytes and return them as a string (lossy on invalid UTF-8).
    pub fn retrieve_as_string(&mut self, n: usize) -> String {
        let n = n.min(self.readable_bytes());
        let s = String::from_utf8_lossy(&self.buf[self.reader_index..self.reader_index + n])
            .into_owned();
        self.retrieve(n);
        s
    }

    /// Consume the whole unread payload as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Append `data`, growing or compacting the storage as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Write `data` backward from the read cursor into the reserved region.
    ///
    /// Panics if `data` is larger than the prependable space; the region is
    /// sized for fixed frame headers, not payload.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    // Either compact or grow, never both: when the wasted prepend+read space
    // is enough to hold `len`, slide the unread bytes back to the prepend
    // boundary; otherwise extend the storage in place.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Read whatever the descriptor has pending with a single scatter read.
    ///
    /// The second iovec points at a 64 KiB stack region and is only included
    /// when the buffer's own writable tail is smaller than that, so one call
    /// can absorb a large burst without pre-growing every idle connection's
    /// buffer. Overflow bytes that landed on the stack are appended afterward,
    /// which is the one place growth happens on the read path.
    pub fn read_fd<Fd: AsFd>(&mut self, fd: Fd) -> nix::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.writer_index);
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra_buf)];
            let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
            readv(fd, &mut iov[..iovcnt])?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Write the unread payload to the descriptor. The caller decides how much
    /// of the buffer to [Buffer::retrieve] based on the returned count, so a
    /// partial write leaves the remainder queued.
    pub fn write_fd<Fd: AsFd>(&self, fd: Fd) -> nix::Result<usize> {
        write(fd, self.peek())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use super::*;

    fn space_invariant(buf: &Buffer) {
        assert_eq!(
            buf.readable_bytes() + buf.writable_bytes() + buf.prependable_bytes(),
            buf.capacity()
        );
    }

    #[test]
    fn test_append_retrieve_cursors() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        space_invariant(&buf);

        buf.append(&[b'x'; 200]);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);
        space_invariant(&buf);

        buf.retrieve(50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);
        space_invariant(&buf);

        // Consuming the rest resets both cursors to the prepend boundary.
        buf.retrieve(buf.readable_bytes());
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn test_round_trip_with_growth() {
        let mut buf = Buffer::new();
        let payload: Vec<u8> = (0..3 * INITIAL_SIZE).map(|i| (i % 251) as u8).collect();
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), payload.len());
        assert_eq!(buf.peek(), payload.as_slice());
        space_invariant(&buf);

        let got = buf.retrieve_all_as_string();
        assert_eq!(got.as_bytes().len(), payload.len());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_compacts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; INITIAL_SIZE]);
        buf.retrieve(800);
        let capacity = buf.capacity();

        // 800 wasted bytes in front, so this append must compact, not grow.
        buf.append(&vec![b'b'; 700]);
        assert_eq!(buf.capacity(), capacity);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE - 800 + 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        space_invariant(&buf);
    }

    #[test]
    fn test_prepend_writes_backward() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn test_read_fd_overflows_into_extra_buf() {
        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();

        // More than the buffer's writable tail so the stack region is used.
        let payload: Vec<u8> = (0..4 * INITIAL_SIZE).map(|i| (i % 199) as u8).collect();
        let mut sent = 0;
        while sent < payload.len() {
            match write(left.as_fd(), &payload[sent..]) {
                Ok(n) => sent += n,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => panic!("socketpair write failed: {}", e),
            }
        }

        let mut buf = Buffer::new();
        let mut total = 0;
        loop {
            match buf.read_fd(right.as_fd()) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => panic!("read_fd failed: {}", e),
            }
        }
        assert_eq!(total, sent);
        assert_eq!(buf.peek(), &payload[..sent]);
        space_invariant(&buf);
    }
}
