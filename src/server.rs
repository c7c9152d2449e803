// src/server.rs
//
// The reactor: one thread multiplexing the listen socket, the wakeup pipe
// and every connection through epoll. Connections are watched one-shot, so
// at most one pool worker ever touches a connection's state; workers report
// task outcomes through a queue drained here, and only this thread mutates
// the connection table and the timer heap.
use crate::auth::UserStore;
use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::error::{NocturneError, NocturneResult};
use crate::logging;
use crate::pool::ThreadPool;
use crate::syscalls::{
    self, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll,
    epoll_event,
};
use crate::timer::TimerHeap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const MAX_EVENTS: usize = 1024;

/// What a worker wants done with its connection once the task finishes.
/// Applied by the reactor thread, never by the worker itself.
enum Outcome {
    RearmRead,
    RearmWrite,
    Close,
}

struct OutcomeQueue {
    pending: Mutex<Vec<(i32, u64, Outcome)>>,
    wake_fd: i32,
}

impl OutcomeQueue {
    fn push(&self, fd: i32, generation: u64, outcome: Outcome) {
        self.pending.lock().unwrap().push((fd, generation, outcome));
        syscalls::wake(self.wake_fd);
    }
}

/// Table entry holding the canonical reference to a connection. Workers
/// get a temporary clone for the task's duration, so teardown cannot free
/// the socket under a task in flight; the generation stamp invalidates
/// outcomes from retired tasks.
struct ConnEntry {
    conn: Arc<Mutex<Connection>>,
    closed: Arc<AtomicBool>,
    generation: u64,
}

/// Remote control for a running reactor; cloneable and thread-safe.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    wake_fd: i32,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        syscalls::wake(self.wake_fd);
    }
}

pub struct Server {
    cfg: ServerConfig,
    src_dir: Arc<PathBuf>,
    epoll: Epoll,
    listen_fd: i32,
    conn_events: i32,
    timer: TimerHeap,
    pool: ThreadPool,
    conns: HashMap<i32, ConnEntry>,
    outcomes: Arc<OutcomeQueue>,
    wake_rd: i32,
    // Fired idle timers park their fd here; drained right after tick.
    expired: Arc<Mutex<Vec<i32>>>,
    running: Arc<AtomicBool>,
    next_generation: u64,
    store: Option<Arc<dyn UserStore>>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> NocturneResult<Self> {
        cfg.validate()?;
        if cfg.log_enabled {
            logging::init_logging(&cfg.log_level);
        }

        let listen_events = EPOLLIN | if cfg.trigger_mode.listen_edge() { EPOLLET } else { 0 };
        let conn_events =
            EPOLLONESHOT | EPOLLRDHUP | if cfg.trigger_mode.conn_edge() { EPOLLET } else { 0 };

        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.linger)?;
        let epoll = Epoll::new()?;
        epoll.add(listen_fd, listen_fd as u64, listen_events)?;

        let (wake_rd, wake_wr) = syscalls::create_wake_pipe()?;
        epoll.add(wake_rd, wake_rd as u64, EPOLLIN)?;

        let pool = ThreadPool::new(cfg.workers, cfg.task_queue_capacity, cfg.pin_workers);

        info!(
            port = cfg.port,
            linger = cfg.linger,
            listen_mode = if cfg.trigger_mode.listen_edge() { "ET" } else { "LT" },
            conn_mode = if cfg.trigger_mode.conn_edge() { "ET" } else { "LT" },
            timeout_ms = cfg.timeout_ms,
            src_dir = %cfg.src_dir.display(),
            "server initialized"
        );

        Ok(Server {
            src_dir: Arc::new(cfg.src_dir.clone()),
            epoll,
            listen_fd,
            conn_events,
            timer: TimerHeap::new(),
            pool,
            conns: HashMap::new(),
            outcomes: Arc::new(OutcomeQueue {
                pending: Mutex::new(Vec::new()),
                wake_fd: wake_wr,
            }),
            wake_rd,
            expired: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(true)),
            next_generation: 0,
            store: None,
            cfg,
        })
    }

    /// Attach the login/registration collaborator.
    pub fn with_store(mut self, store: Arc<dyn UserStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: Arc::clone(&self.running),
            wake_fd: self.outcomes.wake_fd,
        }
    }

    /// Run the reactor loop until stopped. The only place this thread
    /// blocks is the epoll wait, whose timeout is the next timer deadline.
    pub fn run(&mut self) -> NocturneResult<()> {
        if self.cfg.install_ctrl_c {
            let handle = self.handle();
            ctrlc::set_handler(move || {
                info!("SIGINT received, shutting down");
                handle.stop();
            })
            .map_err(|e| NocturneError::Other(format!("ctrl-c handler: {}", e)))?;
        }

        info!("server started");
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while self.running.load(Ordering::Acquire) {
            let timeout_ms: i32 = if self.cfg.timeout_ms > 0 {
                let next = self.timer.next_tick();
                self.drain_expired();
                next.map(|ms| ms.min(i32::MAX as u64) as i32).unwrap_or(-1)
            } else {
                -1
            };

            let n = self.epoll.wait(&mut events, timeout_ms)?;
            for ev in &events[..n] {
                let fd = ev.u64 as i32;
                let bits = ev.events;

                if fd == self.listen_fd {
                    self.deal_listen();
                } else if fd == self.wake_rd {
                    syscalls::drain_wake(self.wake_rd);
                    self.apply_outcomes();
                } else if bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.close_conn(fd);
                } else if bits & EPOLLIN as u32 != 0 {
                    self.dispatch(fd, Direction::Read);
                } else if bits & EPOLLOUT as u32 != 0 {
                    self.dispatch(fd, Direction::Write);
                } else {
                    warn!(fd, bits, "unexpected event");
                }
            }
        }

        info!("server stopping");
        self.pool.shutdown();
        for (_, entry) in self.conns.drain() {
            entry.closed.store(true, Ordering::Release);
        }
        self.timer.clear();
        Ok(())
    }

    /// Accept everything pending. Level-triggered listeners take one
    /// connection per event; edge-triggered ones must drain the queue.
    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if self.conns.len() >= self.cfg.max_connections {
                        warn!(fd, "connection table full, refusing client");
                        let _ = syscalls::send_flat(fd, b"Server Busy");
                        syscalls::close_fd(fd);
                    } else {
                        self.add_client(fd, peer);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
            if !self.cfg.trigger_mode.listen_edge() {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: i32, peer: std::net::SocketAddr) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let conn = Arc::new(Mutex::new(Connection::new(
            fd,
            peer,
            Arc::clone(&self.src_dir),
            self.store.clone(),
        )));

        if let Err(e) = self.epoll.add(fd, fd as u64, EPOLLIN | self.conn_events) {
            // Not fatal: drop this one socket (closed by the connection's
            // Drop) and keep serving.
            warn!(fd, error = %e, "epoll registration failed");
            return;
        }

        if self.cfg.timeout_ms > 0 {
            let expired = Arc::clone(&self.expired);
            self.timer.add(
                fd as u64,
                self.cfg.timeout_ms,
                Box::new(move || expired.lock().unwrap().push(fd)),
            );
        }

        self.conns.insert(
            fd,
            ConnEntry {
                conn,
                closed: Arc::new(AtomicBool::new(false)),
                generation,
            },
        );
        info!(fd, %peer, clients = self.conns.len(), "client connected");
    }

    fn close_conn(&mut self, fd: i32) {
        if let Some(entry) = self.conns.remove(&fd) {
            entry.closed.store(true, Ordering::Release);
            self.timer.cancel(fd as u64);
            let _ = self.epoll.delete(fd);
            info!(fd, clients = self.conns.len(), "client disconnected");
            // The canonical Arc drops here. A worker mid-task still holds
            // its clone, so the fd is not closed (or reused) under it.
        }
    }

    /// Hand the ready connection to the pool. The socket stays un-armed
    /// until the worker's outcome comes back, which is what serializes all
    /// access to the connection. The idle timer is touched at dispatch.
    fn dispatch(&mut self, fd: i32, direction: Direction) {
        let (conn, closed, generation) = match self.conns.get(&fd) {
            Some(e) => (Arc::clone(&e.conn), Arc::clone(&e.closed), e.generation),
            None => return,
        };

        if self.cfg.timeout_ms > 0 {
            self.timer.adjust(fd as u64, self.cfg.timeout_ms);
        }

        let outcomes = Arc::clone(&self.outcomes);
        let et = self.cfg.trigger_mode.conn_edge();

        let task: crate::pool::Task = match direction {
            Direction::Read => Box::new(move || {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                let mut conn = conn.lock().unwrap();
                let outcome = match conn.read(et) {
                    Ok(_) => {
                        if conn.process() {
                            Outcome::RearmWrite
                        } else {
                            Outcome::RearmRead
                        }
                    }
                    Err(e) => {
                        debug!(fd, error = %e, "read closing connection");
                        Outcome::Close
                    }
                };
                drop(conn);
                outcomes.push(fd, generation, outcome);
            }),
            Direction::Write => Box::new(move || {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                let mut conn = conn.lock().unwrap();
                let outcome = match conn.write(et) {
                    Ok(()) => {
                        if conn.to_write_bytes() == 0 {
                            if conn.is_keep_alive() {
                                conn.reset_for_next();
                                Outcome::RearmRead
                            } else {
                                Outcome::Close
                            }
                        } else {
                            Outcome::RearmWrite
                        }
                    }
                    Err(e) => {
                        debug!(fd, error = %e, "write closing connection");
                        Outcome::Close
                    }
                };
                drop(conn);
                outcomes.push(fd, generation, outcome);
            }),
        };

        if !self.pool.submit(task) {
            // Admission control: under overload the newest ready
            // connection is dropped rather than queued without bound.
            warn!(fd, "task queue full, dropping connection");
            self.close_conn(fd);
        }
    }

    /// Apply worker outcomes on the reactor thread. An outcome whose
    /// generation no longer matches the table belongs to a connection that
    /// was closed (or its fd recycled) meanwhile and is silently dropped.
    fn apply_outcomes(&mut self) {
        let drained = std::mem::take(&mut *self.outcomes.pending.lock().unwrap());
        for (fd, generation, outcome) in drained {
            let current = self.conns.get(&fd).map(|e| e.generation);
            if current != Some(generation) {
                continue;
            }
            let rearm = match outcome {
                Outcome::RearmRead => Some(EPOLLIN),
                Outcome::RearmWrite => Some(EPOLLOUT),
                Outcome::Close => None,
            };
            match rearm {
                Some(interest) => {
                    if let Err(e) = self.epoll.modify(fd, fd as u64, interest | self.conn_events) {
                        warn!(fd, error = %e, "re-arm failed");
                        self.close_conn(fd);
                    }
                }
                None => self.close_conn(fd),
            }
        }
    }

    fn drain_expired(&mut self) {
        let expired = std::mem::take(&mut *self.expired.lock().unwrap());
        for fd in expired {
            debug!(fd, "idle timeout");
            self.close_conn(fd);
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.wake_rd);
        syscalls::close_fd(self.outcomes.wake_fd);
    }
}
