// src/pool.rs
//
// Fixed-size worker pool draining a bounded FIFO queue. Submission is
// fire-and-forget; the reactor only cares whether the task was accepted.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::debug;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

struct PoolState {
    queue: VecDeque<Task>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    capacity: usize,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `workers` threads (floored at 2; 0 selects host parallelism)
    /// sharing a queue bounded at `capacity` tasks. With `pin_workers` set,
    /// threads are pinned round-robin onto the available cores.
    pub fn new(workers: usize, capacity: usize, pin_workers: bool) -> Self {
        let count = if workers == 0 {
            num_cpus::get().max(2)
        } else {
            workers.max(2)
        };

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        });

        let core_ids = if pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    Self::worker_loop(&shared);
                })
                .expect("failed to spawn worker thread");

            handles.push(handle);
        }

        ThreadPool {
            shared,
            workers: handles,
        }
    }

    fn worker_loop(shared: &PoolShared) {
        let mut state = shared.state.lock().unwrap();
        loop {
            // Shutdown is checked before popping: work still queued when
            // the flag goes up is dropped, not run.
            if state.shutdown {
                return;
            }
            match state.queue.pop_front() {
                Some(task) => {
                    drop(state);
                    task();
                    state = shared.state.lock().unwrap();
                }
                None => {
                    state = shared.available.wait(state).unwrap();
                }
            }
        }
    }

    /// Enqueue a unit of work. Returns false once shutdown has begun or
    /// when the queue is at capacity; the caller decides what to drop.
    pub fn submit(&self, task: Task) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown || state.queue.len() >= self.shared.capacity {
            return false;
        }
        state.queue.push_back(task);
        drop(state);
        self.shared.available.notify_one();
        true
    }

    /// Stop accepting work, wake every worker, and join them. A task a
    /// worker had already dequeued runs to completion; tasks still queued
    /// are discarded.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
