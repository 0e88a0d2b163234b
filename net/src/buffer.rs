use std::io::IoSliceMut;
use std::os::fd::RawFd;

use crate::sockets;

/// Bytes reserved in front of the readable region so a length header can be
/// prepended without copying the payload.
pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 4 * 1024;

/// Secondary stack region for scattered reads; bounds the number of read
/// syscalls per readiness event.
const EXTRA_BUF_SIZE: usize = 1024 * 1024;

/// Resizable byte window with reader/writer indices.
///
/// ```text
/// | prependable |     readable     |    writable    |
/// 0 ........ reader ............ writer ........ capacity
/// ```
///
/// Invariant: `0 <= reader <= writer <= capacity`. The reader consumes from
/// the front, the writer appends at the back, and the gap in front of the
/// reader absorbs prepended headers.
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self { buf: vec![0; CHEAP_PREPEND + initial], reader: CHEAP_PREPEND, writer: CHEAP_PREPEND }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Insert `data` right in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader -= data.len();
        self.buf[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    #[inline]
    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    #[inline]
    pub fn prepend_u32(&mut self, v: u32) {
        self.prepend(&v.to_be_bytes());
    }

    /// Big-endian peek of the first 4 readable bytes, without consuming.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut be = [0u8; 4];
        be.copy_from_slice(&self.buf[self.reader..self.reader + 4]);
        u32::from_be_bytes(be)
    }

    pub fn read_u32(&mut self) -> u32 {
        let v = self.peek_u32();
        self.retrieve(4);
        v
    }

    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.buf.resize(self.writer + n, 0);
        } else {
            // compact: move the readable bytes back to the front
            let readable = self.readable_bytes();
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// One scattered read from `fd` into the writable region plus a stack
    /// scratch; the overflow is appended afterwards with growth. Returns the
    /// number of bytes read.
    pub fn read_fd(&mut self, fd: RawFd) -> nix::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let writer = self.writer;
            let mut iov =
                [IoSliceMut::new(&mut self.buf[writer..]), IoSliceMut::new(&mut extra)];
            let cnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
            sockets::readv_fd(fd, &mut iov[..cnt])?
        };
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}
