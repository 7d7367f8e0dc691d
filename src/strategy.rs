// Copyright 2020 Joyent, Inc.

//! Policies that decide where an accepted connection is handled.
//!
//! The accept loop hands each fresh socket to its [`Strategy`], which either
//! declines it, serves it inline on the acceptor's own loop, or adopts it
//! into a process, thread, or pool worker of its own. Every accepted socket
//! has exactly one owner at any time: a strategy that adopts a socket is
//! responsible for making sure it eventually closes.

use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::unistd::{fork, ForkResult};
use slog::{debug, error};

use crate::pool::{PoolWorker, WorkerPool};
use crate::server::{handle_connection, Notify, ServerCore};

/// What a strategy decided to do with an accepted socket.
pub enum Disposition {
    /// Serve the connection on the acceptor's own loop.
    Inline(TcpStream),
    /// The strategy took ownership; the acceptor moves on immediately.
    Adopted,
    /// The connection is dropped.
    Declined,
}

/// The per-connection policy hooks. `on_notify` fires at the top of every
/// wait loop, `shutdown` once the accept loop has exited.
pub trait Strategy: Send + Sync {
    fn on_connection(&self, core: &Arc<ServerCore>, stream: TcpStream) -> Disposition;

    fn on_notify(&self, _core: &ServerCore, _note: Notify) {}

    fn shutdown(&self) {}
}

/// Serves one connection at a time on the accept loop itself. No
/// concurrency; useful as a baseline and in tests.
pub struct InlineStrategy;

impl Strategy for InlineStrategy {
    fn on_connection(&self, _core: &Arc<ServerCore>, stream: TcpStream) -> Disposition {
        Disposition::Inline(stream)
    }
}

/// Forks a child process per connection. The parent closes its copy of the
/// socket and keeps accepting; the child serves the connection and then
/// stops its copy of the server, since only the parent may accept.
pub struct ForkStrategy {
    is_child: AtomicBool,
}

impl ForkStrategy {
    pub fn new() -> ForkStrategy {
        ForkStrategy {
            is_child: AtomicBool::new(false),
        }
    }
}

impl Default for ForkStrategy {
    fn default() -> ForkStrategy {
        ForkStrategy::new()
    }
}

impl Strategy for ForkStrategy {
    fn on_connection(&self, core: &Arc<ServerCore>, stream: TcpStream) -> Disposition {
        // fork is unsafe in a multithreaded process; this strategy spawns
        // no threads, so the server process has only the accept loop.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                self.is_child.store(true, Ordering::SeqCst);
                Disposition::Inline(stream)
            }
            Ok(ForkResult::Parent { child }) => {
                debug!(core.log(), "forked connection handler"; "child" => child.as_raw());
                // The child owns the connection now; the parent's copy
                // closes on drop.
                Disposition::Declined
            }
            Err(e) => {
                error!(core.log(), "fork failed"; "err" => %e);
                Disposition::Declined
            }
        }
    }

    fn on_notify(&self, core: &ServerCore, note: Notify) {
        if note == Notify::WaitingForConnection && self.is_child.load(Ordering::SeqCst) {
            core.stop();
        }
    }
}

/// Spawns a dedicated thread per connection. In-flight handlers live in a
/// registry keyed by a monotonically assigned id; `shutdown` joins whatever
/// is still running.
pub struct ThreadStrategy {
    registry: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: AtomicU64,
}

impl ThreadStrategy {
    pub fn new() -> ThreadStrategy {
        ThreadStrategy {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for ThreadStrategy {
    fn default() -> ThreadStrategy {
        ThreadStrategy::new()
    }
}

impl Strategy for ThreadStrategy {
    fn on_connection(&self, core: &Arc<ServerCore>, stream: TcpStream) -> Disposition {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::clone(&self.registry);
        let thread_core = Arc::clone(core);
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || {
                debug!(thread_core.log(), "processing connection"; "worker" => id);
                handle_connection(&thread_core, stream);
                // A finished handler unregisters itself; anything left in
                // the registry at shutdown is joined there.
                registry.lock().unwrap().remove(&id);
            });
        match spawned {
            Ok(handle) => {
                self.registry.lock().unwrap().insert(id, handle);
                Disposition::Adopted
            }
            Err(e) => {
                // The closure owned the stream, so a failed spawn already
                // closed the connection.
                error!(core.log(), "failed to spawn connection thread"; "err" => %e);
                Disposition::Adopted
            }
        }
    }

    fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock().unwrap();
            registry.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

struct ConnWorker;

impl PoolWorker for ConnWorker {
    type Job = (Arc<ServerCore>, TcpStream);

    fn on_job(&self, idx: usize, job: Self::Job) {
        let (core, stream) = job;
        debug!(core.log(), "processing connection from the pool"; "worker" => idx);
        handle_connection(&core, stream);
    }
}

/// Hands each connection to a bounded pool of worker threads. Connections
/// queue when every worker is busy.
pub struct PoolStrategy {
    pool: WorkerPool<ConnWorker>,
}

impl PoolStrategy {
    pub fn new(workers: usize) -> io::Result<PoolStrategy> {
        Ok(PoolStrategy {
            pool: WorkerPool::create(workers, ConnWorker)?,
        })
    }

    /// Connections accepted but not yet picked up by a worker.
    pub fn queue_len(&self) -> usize {
        self.pool.queue_len()
    }
}

impl Strategy for PoolStrategy {
    fn on_connection(&self, core: &Arc<ServerCore>, stream: TcpStream) -> Disposition {
        match self.pool.post_request((Arc::clone(core), stream), false) {
            Ok(()) => Disposition::Adopted,
            Err((_, stream)) => {
                error!(core.log(), "pool is not accepting connections");
                drop(stream);
                Disposition::Declined
            }
        }
    }

    fn shutdown(&self) {
        self.pool.destroy(false);
    }
}
