// src/server.rs
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conn::HttpConn;
use crate::db::SqlPool;
use crate::error::ServerResult;
use crate::pool::ThreadPool;
use crate::syscalls::{
    self, Epoll, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP,
};
use crate::timer::TimerHeap;

/// Maximum concurrent connections; accepts beyond it are refused.
pub const MAX_FD: i32 = 65536;

const EVENT_CAPACITY: usize = 1024;

/// Upper bound on a single epoll wait so the shutdown flag is observed
/// promptly even with no timer armed.
const WAIT_SLICE_MS: i32 = 500;

/// State shared between the reactor thread and worker tasks.
pub struct ServerState {
    epoll: Epoll,
    user_count: AtomicI32,
    src_dir: PathBuf,
    sql: Option<SqlPool>,
    conn_event: u32,
    shutdown: AtomicBool,
}

impl ServerState {
    pub fn user_count(&self) -> i32 {
        self.user_count.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn conn_et(&self) -> bool {
        self.conn_event & EPOLLET != 0
    }
}

/// Event bitsets for the listener and for connections, per trigger-mode
/// selector. One-shot is always on for connections; it is what serializes
/// worker access to an fd.
fn event_mode(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = EPOLLRDHUP;
    let mut conn_event = EPOLLONESHOT | EPOLLRDHUP;
    match trig_mode {
        0 => {}
        1 => conn_event |= EPOLLET,
        2 => listen_event |= EPOLLET,
        _ => {
            listen_event |= EPOLLET;
            conn_event |= EPOLLET;
        }
    }
    (listen_event, conn_event)
}

/// Single-reactor, multi-worker HTTP server.
///
/// The reactor thread owns the listener, the fd→connection map, and the
/// timer heap. Workers drive the per-connection state machine and re-arm
/// interest through the shared epoll handle.
pub struct Server {
    cfg: Config,
    listen_fd: RawFd,
    listen_event: u32,
    state: Arc<ServerState>,
    timer: TimerHeap,
    pool: ThreadPool,
    users: HashMap<RawFd, Arc<HttpConn>>,
}

impl Server {
    pub fn new(cfg: Config) -> ServerResult<Self> {
        cfg.validate()?;
        let (listen_event, conn_event) = event_mode(cfg.trig_mode);

        let sql = if cfg.sql_pool_size > 0 {
            match SqlPool::connect(&cfg, cfg.sql_pool_size) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "sql pool unavailable, credential checks will fail");
                    None
                }
            }
        } else {
            None
        };

        let epoll = Epoll::new()?;
        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.linger)?;
        epoll.add(listen_fd, listen_event | EPOLLIN)?;

        let src_dir = cfg.resolved_src_dir();
        let workers = cfg.resolved_workers();
        let pool = ThreadPool::new(workers)?;
        info!(
            port = cfg.port,
            listen_et = listen_event & EPOLLET != 0,
            conn_et = conn_event & EPOLLET != 0,
            timeout_ms = cfg.timeout_ms,
            workers,
            src_dir = %src_dir.display(),
            "server init"
        );

        Ok(Self {
            state: Arc::new(ServerState {
                epoll,
                user_count: AtomicI32::new(0),
                src_dir,
                sql,
                conn_event,
                shutdown: AtomicBool::new(false),
            }),
            pool,
            timer: TimerHeap::new(),
            users: HashMap::new(),
            listen_fd,
            listen_event,
            cfg,
        })
    }

    /// Handle for requesting shutdown from another thread.
    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Run the reactor loop until shutdown is requested.
    pub fn run(mut self) -> ServerResult<()> {
        let handler_state = self.state.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received SIGINT, shutting down");
            handler_state.request_shutdown();
        }) {
            debug!(error = %e, "ctrl-c handler not installed");
        }

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_CAPACITY];
        info!("server start");

        while !self.state.is_shutdown() {
            let mut timeout = -1;
            if self.cfg.timeout_ms > 0 {
                timeout = self.timer.next_tick();
            }
            // Slice long waits so a shutdown request is seen without an event.
            let timeout = if timeout < 0 {
                WAIT_SLICE_MS
            } else {
                timeout.min(WAIT_SLICE_MS)
            };

            let n = match self.state.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    continue;
                }
            };

            for ev in &events[..n] {
                let fd = syscalls::event_fd(ev);
                // Copy out of the (packed) event struct before use.
                let bits = ev.events;
                if fd == self.listen_fd {
                    self.deal_listen();
                    continue;
                }
                let Some(conn) = self.users.get(&fd).cloned() else {
                    debug!(fd, "event for unknown fd");
                    continue;
                };
                if conn.is_closed() {
                    self.users.remove(&fd);
                    continue;
                }
                if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    close_conn(&self.state, &conn);
                    self.users.remove(&fd);
                } else if bits & EPOLLIN != 0 {
                    self.extend_time(fd);
                    self.submit_task(conn, on_read);
                } else if bits & EPOLLOUT != 0 {
                    self.extend_time(fd);
                    self.submit_task(conn, on_write);
                } else {
                    warn!(fd, events = bits, "unexpected event");
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "accept failed");
                    return;
                }
                Ok(Some((fd, addr))) => {
                    if self.state.user_count() >= MAX_FD {
                        syscalls::send_refusal(fd, "Server busy!");
                        warn!("clients are full");
                        return;
                    }
                    self.add_client(fd, addr);
                }
            }
            if self.listen_event & EPOLLET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: std::net::SocketAddr) {
        let conn = Arc::new(HttpConn::new(fd, addr));
        self.state.user_count.fetch_add(1, Ordering::AcqRel);
        self.users.insert(fd, conn.clone());

        if self.cfg.timeout_ms > 0 {
            let state = self.state.clone();
            let timed_out = conn.clone();
            self.timer
                .add(fd, Duration::from_millis(self.cfg.timeout_ms), move || {
                    debug!(fd = timed_out.fd(), "idle timeout");
                    close_conn(&state, &timed_out);
                });
        }

        if let Err(e) = syscalls::set_nonblocking(fd) {
            error!(fd, error = %e, "set nonblocking failed");
            close_conn(&self.state, &conn);
            self.users.remove(&fd);
            return;
        }
        if let Err(e) = self.state.epoll.add(fd, EPOLLIN | self.state.conn_event) {
            error!(fd, error = %e, "epoll add failed");
            close_conn(&self.state, &conn);
            self.users.remove(&fd);
            return;
        }
        info!(fd, peer = %addr, users = self.state.user_count(), "client in");
    }

    /// Hand a connection task to the pool. A fault inside the task must not
    /// cross the worker boundary; it is logged and the connection closed.
    fn submit_task(
        &self,
        conn: Arc<HttpConn>,
        task: fn(&Arc<ServerState>, &Arc<HttpConn>),
    ) {
        let state = self.state.clone();
        self.pool.submit(move || {
            let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                task(&state, &conn)
            }));
            if caught.is_err() {
                error!(fd = conn.fd(), "connection task panicked");
                close_conn(&state, &conn);
            }
        });
    }

    fn extend_time(&mut self, fd: RawFd) {
        if self.cfg.timeout_ms > 0 {
            self.timer
                .adjust(fd, Duration::from_millis(self.cfg.timeout_ms));
        }
    }

    fn shutdown(self) {
        info!("server shutting down");
        let Server {
            state,
            pool,
            users,
            listen_fd,
            ..
        } = self;
        // Release any worker blocked on a checkout, then join the workers.
        if let Some(sql) = &state.sql {
            sql.close();
        }
        drop(pool);
        for (_, conn) in users {
            close_conn(&state, &conn);
        }
        syscalls::close_fd(listen_fd);
        info!("server stopped");
    }
}

/// Tear a connection down: remove it from the notifier, release the file
/// mapping, close the socket, drop the user count. Safe to call more than
/// once and from any thread.
pub(crate) fn close_conn(state: &ServerState, conn: &HttpConn) {
    if conn.mark_closed() {
        return;
    }
    let _ = state.epoll.delete(conn.fd());
    conn.release_mmap();
    syscalls::close_fd(conn.fd());
    let users = state.user_count.fetch_sub(1, Ordering::AcqRel) - 1;
    info!(fd = conn.fd(), peer = %conn.addr(), users, "client quit");
}

/// Read task, run on a worker.
fn on_read(state: &Arc<ServerState>, conn: &Arc<HttpConn>) {
    if conn.is_closed() {
        return;
    }
    match conn.read(state.conn_et()) {
        Ok(0) => {
            close_conn(state, conn);
            return;
        }
        Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
            debug!(fd = conn.fd(), error = %e, "read failed");
            close_conn(state, conn);
            return;
        }
        _ => {}
    }
    on_process(state, conn);
}

/// Parse-and-respond step; re-arms interest according to the outcome.
fn on_process(state: &Arc<ServerState>, conn: &Arc<HttpConn>) {
    if conn.is_closed() {
        return;
    }
    let interest = if conn.process(&state.src_dir, state.sql.as_ref()) {
        EPOLLOUT
    } else {
        EPOLLIN
    };
    if let Err(e) = state.epoll.modify(conn.fd(), interest | state.conn_event) {
        debug!(fd = conn.fd(), error = %e, "re-arm failed");
        close_conn(state, conn);
    }
}

/// Write task, run on a worker.
fn on_write(state: &Arc<ServerState>, conn: &Arc<HttpConn>) {
    if conn.is_closed() {
        return;
    }
    let result = conn.write(state.conn_et());
    if conn.to_write_bytes() == 0 {
        // Transfer complete.
        if conn.is_keep_alive() && !state.is_shutdown() {
            on_process(state, conn);
            return;
        }
    } else {
        match result {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                debug!(fd = conn.fd(), error = %e, "write failed");
            }
            _ => {
                // Partial write or kernel buffer full: wait for the next
                // writable event.
                if state
                    .epoll
                    .modify(conn.fd(), EPOLLOUT | state.conn_event)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }
    close_conn(state, conn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mode_selector() {
        let (l, c) = event_mode(0);
        assert_eq!(l & EPOLLET, 0);
        assert_eq!(c & EPOLLET, 0);
        assert_ne!(c & EPOLLONESHOT, 0);

        let (l, c) = event_mode(1);
        assert_eq!(l & EPOLLET, 0);
        assert_ne!(c & EPOLLET, 0);

        let (l, c) = event_mode(2);
        assert_ne!(l & EPOLLET, 0);
        assert_eq!(c & EPOLLET, 0);

        let (l, c) = event_mode(3);
        assert_ne!(l & EPOLLET, 0);
        assert_ne!(c & EPOLLET, 0);
        assert_ne!(c & EPOLLONESHOT, 0);
        assert_ne!(c & EPOLLRDHUP, 0);
    }
}
