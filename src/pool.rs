// src/pool.rs
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::error::ServerResult;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size set of worker threads draining a shared FIFO of closures.
///
/// Dropping the pool sets the closed flag and broadcasts; workers finish the
/// queued tasks and exit. A panicking task is caught at the worker boundary
/// and logged, the worker stays alive.
pub struct ThreadPool {
    shared: Arc<Shared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(count: usize) -> ServerResult<Self> {
        assert!(count >= 1, "thread pool needs at least one worker");
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let shared_worker = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("minuet-worker-{}", i))
                .spawn(move || worker_loop(shared_worker));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Unwind the workers already started before reporting.
                    shared.state.lock().unwrap().closed = true;
                    shared.available.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Self { shared, handles })
    }

    /// Enqueue a unit of work and wake one waiting worker. Tasks submitted
    /// after close are dropped.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, task: F) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                debug!("task submitted to closed pool, dropping");
                return;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("worker task panicked");
            }
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.available.wait(state).unwrap();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
        }
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
