//! Blocking SQL connection pool and credential verification.
//!
//! The pool owns a fixed set of eagerly-connected clients. Checkout blocks
//! on a condition variable while the pool is empty; the returned guard
//! hands the client back on drop. Only the two auth paths ever touch the
//! database, so the pool stays small.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ServerError, ServerResult};

struct PoolState {
    clients: VecDeque<Client>,
    closed: bool,
}

pub struct SqlPool {
    state: Mutex<PoolState>,
    available: Condvar,
    size: usize,
}

impl SqlPool {
    /// Eagerly open `size` connections with the configured credentials.
    pub fn connect(cfg: &Config, size: usize) -> ServerResult<Self> {
        let params = format!(
            "host={} port={} user={} password={} dbname={}",
            cfg.db_host, cfg.db_port, cfg.db_user, cfg.db_password, cfg.db_name
        );
        let mut clients = VecDeque::with_capacity(size);
        for _ in 0..size {
            clients.push_back(Client::connect(&params, NoTls)?);
        }
        info!(size, host = %cfg.db_host, db = %cfg.db_name, "sql pool ready");
        Ok(Self {
            state: Mutex::new(PoolState {
                clients,
                closed: false,
            }),
            available: Condvar::new(),
            size,
        })
    }

    /// Check out a connection, blocking until one is free.
    pub fn get(&self) -> ServerResult<SqlConn<'_>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(ServerError::PoolClosed);
            }
            if let Some(client) = state.clients.pop_front() {
                return Ok(SqlConn {
                    pool: self,
                    client: Some(client),
                });
            }
            state = self.available.wait(state).unwrap();
        }
    }

    pub fn pool_size(&self) -> usize {
        self.size
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    /// Drop every pooled connection and wake all waiters.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.clients.clear();
        drop(state);
        self.available.notify_all();
    }
}

impl Drop for SqlPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// RAII checkout; the client rejoins the pool on drop.
pub struct SqlConn<'a> {
    pool: &'a SqlPool,
    client: Option<Client>,
}

impl Deref for SqlConn<'_> {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl DerefMut for SqlConn<'_> {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().unwrap()
    }
}

impl Drop for SqlConn<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let mut state = self.pool.state.lock().unwrap();
            if !state.closed {
                state.clients.push_back(client);
                drop(state);
                self.pool.available.notify_one();
            }
        }
    }
}

/// Check a username/password pair against the `user` table.
///
/// Login succeeds iff the stored password matches. Registration fails on a
/// taken username and succeeds only when the insert itself succeeds. Any
/// database trouble counts as a failed verification.
pub fn user_verify(pool: Option<&SqlPool>, name: &str, pwd: &str, is_login: bool) -> bool {
    if name.is_empty() || pwd.is_empty() {
        return false;
    }
    let Some(pool) = pool else {
        warn!("credential check without a sql pool, rejecting");
        return false;
    };
    let mut conn = match pool.get() {
        Ok(conn) => conn,
        Err(e) => {
            error!(error = %e, "sql pool checkout failed");
            return false;
        }
    };

    let existing = match conn.query_opt(
        "SELECT password FROM \"user\" WHERE username = $1 LIMIT 1",
        &[&name],
    ) {
        Ok(row) => row,
        Err(e) => {
            error!(error = %e, "user lookup failed");
            return false;
        }
    };

    if is_login {
        match existing {
            Some(row) => match row.try_get::<_, String>(0) {
                Ok(stored) => {
                    let ok = stored == pwd;
                    if !ok {
                        debug!(user = %name, "password mismatch");
                    }
                    ok
                }
                Err(e) => {
                    error!(error = %e, "password column read failed");
                    false
                }
            },
            None => {
                debug!(user = %name, "unknown user");
                false
            }
        }
    } else {
        if existing.is_some() {
            debug!(user = %name, "username taken");
            return false;
        }
        match conn.execute(
            "INSERT INTO \"user\" (username, password) VALUES ($1, $2)",
            &[&name, &pwd],
        ) {
            Ok(_) => {
                info!(user = %name, "registered");
                true
            }
            Err(e) => {
                error!(error = %e, "insert failed");
                false
            }
        }
    }
}
