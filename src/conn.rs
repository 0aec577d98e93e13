// src/conn.rs
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::buffer::Buffer;
use crate::db::SqlPool;
use crate::error::ServerError;
use crate::request::Request;
use crate::response::Response;
use crate::syscalls;

/// Write-loop threshold: below this many pending bytes a level-triggered
/// writer yields back to the reactor instead of spinning.
const WRITE_LOOP_THRESHOLD: usize = 10240;

struct ConnInner {
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    /// Bytes of the mmap body already handed to the socket; slot 0 of the
    /// vectored write (the header bytes) is consumed first.
    body_written: usize,
}

/// One client connection: socket, peer address, buffers, and the HTTP
/// state machine.
///
/// The inner state is mutated by at most one worker at a time, the
/// exclusion coming from the notifier's one-shot flag rather than lock
/// contention; the mutex exists to make that hand-off sound. The closed
/// flag gates late-arriving tasks after a timer or error teardown.
pub struct HttpConn {
    fd: i32,
    addr: SocketAddr,
    closed: AtomicBool,
    inner: Mutex<ConnInner>,
}

impl HttpConn {
    pub fn new(fd: i32, addr: SocketAddr) -> Self {
        Self {
            fd,
            addr,
            closed: AtomicBool::new(false),
            inner: Mutex::new(ConnInner {
                read_buf: Buffer::new(),
                write_buf: Buffer::new(),
                request: Request::new(),
                response: Response::new(),
                body_written: 0,
            }),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the closed flag; returns whether it was already set, making
    /// the close path idempotent.
    pub fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }

    /// Drop the response's file mapping if the inner state is not mid-task.
    pub fn release_mmap(&self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.response.unmap();
        }
    }

    /// Drain the socket into the read buffer. Edge-triggered connections
    /// loop until WouldBlock (surfaced as the error); the result carries
    /// the last read's outcome, `Ok(0)` meaning end of stream.
    pub fn read(&self, et: bool) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let n = inner.read_buf.read_from(self.fd)?;
            if n == 0 {
                return Ok(0);
            }
            if !et {
                return Ok(n);
            }
        }
    }

    /// Vectored write of header bytes and mmap body. Loops while
    /// edge-triggered or while more than the spin threshold remains.
    pub fn write(&self, et: bool) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut last = 0;
        loop {
            let remaining = inner.write_buf.readable_bytes()
                + inner.response.file_len().saturating_sub(inner.body_written);
            if remaining == 0 {
                return Ok(last);
            }
            let (n, head_len) = {
                let head = inner.write_buf.peek();
                let body = match inner.response.file() {
                    Some(map) => &map.as_slice()[inner.body_written..],
                    None => &[][..],
                };
                (syscalls::writev2(self.fd, head, body)?, head.len())
            };
            if n == 0 {
                return Ok(last);
            }
            last = n;
            if n > head_len {
                inner.body_written += n - head_len;
                if head_len > 0 {
                    inner.write_buf.retrieve_all();
                }
            } else {
                inner.write_buf.retrieve(n);
            }
            let remaining = inner.write_buf.readable_bytes()
                + inner.response.file_len().saturating_sub(inner.body_written);
            if remaining == 0 || !(et || remaining > WRITE_LOOP_THRESHOLD) {
                return Ok(last);
            }
        }
    }

    pub fn to_write_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.write_buf.readable_bytes() + inner.response.file_len().saturating_sub(inner.body_written)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.inner.lock().unwrap().response.keep_alive()
    }

    /// Parse whatever is buffered and, if a full request is there, build
    /// the response. Returns false when more bytes are needed.
    pub fn process(&self, src_dir: &Path, sql: Option<&SqlPool>) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.read_buf.readable_bytes() == 0 {
            return false;
        }
        match inner.request.parse(&mut inner.read_buf) {
            Ok(false) => return false,
            Ok(true) => {
                inner.request.resolve_auth(sql);
                let keep_alive = inner.request.is_keep_alive();
                let path = inner.request.path().to_owned();
                debug!(fd = self.fd, path = %path, "request");
                inner.response.init(src_dir, path, keep_alive, Some(200));
            }
            Err(e) => {
                let err = ServerError::from(e);
                debug!(fd = self.fd, error = %err, "bad request");
                let path = inner.request.path().to_owned();
                inner.response.init(src_dir, path, false, Some(400));
            }
        }
        inner.response.make_response(&mut inner.write_buf);
        inner.body_written = 0;
        // Ready for the next request on this connection.
        inner.request.init();
        true
    }
}
