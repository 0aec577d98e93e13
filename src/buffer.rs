// src/buffer.rs
use std::io;
use std::os::unix::io::RawFd;

use crate::syscalls;

const INITIAL_SIZE: usize = 1024;

/// Size of the stack-resident spill region used by `read_from`. A single
/// scatter read can capture a full edge-triggered drain even when the
/// buffer tail is small.
const SPILL_SIZE: usize = 64 * 1024;

/// Contiguous byte region with a read and a write cursor.
///
/// Invariant: `0 <= read <= write <= capacity`. Bytes in `[read, write)` are
/// readable; `[write, capacity)` is writable; `[0, read)` is prependable and
/// reclaimed by compaction when an append would not otherwise fit.
pub struct Buffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read: 0,
            write: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write - self.read
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read
    }

    /// The unread region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    /// The writable tail. Pair with `has_written` after filling it.
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.write..]
    }

    /// Guarantee at least `n` writable bytes, compacting unread data to
    /// offset 0 when the slack suffices and reallocating otherwise.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() < n {
            self.make_space(n);
        }
        debug_assert!(self.writable_bytes() >= n);
    }

    /// Advance the write cursor over bytes filled in `begin_write`.
    pub fn has_written(&mut self, n: usize) {
        debug_assert!(n <= self.writable_bytes());
        self.write += n;
    }

    /// Consume `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        self.read += n;
    }

    /// Consume readable bytes up to offset `end` within `peek()`.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Reset both cursors and zero the region.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read = 0;
        self.write = 0;
    }

    /// Drain the readable region into an owned string (lossy UTF-8).
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write..self.write + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn append_buffer(&mut self, other: &Buffer) {
        self.append(other.peek());
    }

    /// Scatter-read from `fd`: the writable tail first, then a 64 KiB stack
    /// spill appended (growing the buffer) so one syscall drains the socket.
    /// Returns the byte count of the read; 0 is end of stream.
    pub fn read_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut spill = [0u8; SPILL_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let tail_start = self.write;
            syscalls::readv2(fd, &mut self.buf[tail_start..], &mut spill)?
        };
        if n <= writable {
            self.write += n;
        } else {
            self.write = self.buf.len();
            self.append(&spill[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd`, consuming what was accepted.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::write_fd(fd, self.peek())?;
        self.retrieve(n);
        Ok(n)
    }

    fn make_space(&mut self, n: usize) {
        if self.prependable_bytes() + self.writable_bytes() < n {
            self.buf.resize(self.write + n + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read..self.write, 0);
            self.read = 0;
            self.write = readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn cursors_hold_invariant() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.writable_bytes(), 11);
        assert_eq!(buf.prependable_bytes(), 0);
        buf.retrieve(2);
        assert_eq!(buf.readable_bytes(), 3);
        assert_eq!(buf.prependable_bytes(), 2);
        assert_eq!(buf.peek(), b"llo");
    }

    #[test]
    fn retrieve_all_to_string_round_trips_and_resets() {
        let mut buf = Buffer::new();
        buf.append(b"plain ascii round trip");
        assert_eq!(buf.retrieve_all_to_string(), "plain ascii round trip");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn append_buffer_transfers_readable_region() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        a.append(b"left");
        b.append(b"right");
        a.append_buffer(&b);
        assert_eq!(a.peek(), b"leftright");
    }

    #[test]
    fn grow_reallocates_when_slack_is_short() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"12345678");
        buf.append(b"9abcdef");
        assert_eq!(buf.peek(), b"123456789abcdef");
    }

    #[test]
    fn grow_compacts_when_prependable_suffices() {
        let mut buf = Buffer::with_capacity(8);
        buf.append(b"12345678");
        buf.retrieve(6);
        // 2 readable, 6 prependable: a 5-byte append compacts in place.
        buf.append(b"abcde");
        assert_eq!(buf.peek(), b"78abcde");
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn retrieve_until_consumes_line() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nrest");
        let pos = buf.peek().windows(2).position(|w| w == b"\r\n").unwrap();
        buf.retrieve_until(pos + 2);
        assert_eq!(buf.peek(), b"rest");
    }

    #[test]
    fn read_from_socket_fills_tail() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"over the wire").unwrap();
        let mut buf = Buffer::new();
        let n = buf.read_from(b.as_raw_fd()).unwrap();
        assert_eq!(n, 13);
        assert_eq!(buf.peek(), b"over the wire");
    }

    #[test]
    fn read_from_spills_past_small_tail() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let payload = vec![b'x'; 4096];
        a.write_all(&payload).unwrap();
        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_from(b.as_raw_fd()).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(buf.readable_bytes(), 4096);
        assert!(buf.peek().iter().all(|&c| c == b'x'));
    }

    #[test]
    fn write_to_socket_consumes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let n = buf.write_to(a.as_raw_fd()).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buf.readable_bytes(), 0);
        let mut got = [0u8; 7];
        use std::io::Read;
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"payload");
    }
}
