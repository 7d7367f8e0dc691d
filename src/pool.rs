// Copyright 2020 Joyent, Inc.

//! A fixed-size pool of worker threads consuming from a double-ended request
//! queue. Requests are posted at normal or high priority; high-priority
//! requests go to the front of the queue and are served before everything
//! queued behind them, but never preempt running work. A counting semaphore
//! is posted in lockstep with every enqueue, so its value always equals the
//! queue length.
//!
//! Shutdown is cooperative: `destroy` enqueues one exit marker per worker and
//! joins them all. With `wait_drain` the markers go to the back of the queue
//! so all pending work completes first; without it they go to the front so
//! workers exit as soon as their current request finishes.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// The callbacks a pool owner supplies. `on_job` runs on a pool thread;
/// `on_init_thread` and `on_exit_thread` bracket each worker's lifetime.
pub trait PoolWorker: Send + Sync + 'static {
    type Job: Send + 'static;

    fn on_init_thread(&self, _idx: usize) {}
    fn on_job(&self, idx: usize, job: Self::Job);
    fn on_exit_thread(&self, _idx: usize) {}
}

// A queue entry is either work or the exit marker; the marker cannot be
// forged through `post_request` because it is not a `Job`.
enum Task<J> {
    Run(J),
    Exit,
}

// Counting semaphore. `wait` blocks until the count is positive, then
// decrements it.
struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }
}

struct PoolState<J> {
    queue: VecDeque<Task<J>>,
    ready: bool,
}

struct PoolInner<W: PoolWorker> {
    worker: W,
    state: Mutex<PoolState<W::Job>>,
    sem: Semaphore,
}

/// A fixed-size worker pool. See the module documentation for the queueing
/// and shutdown semantics.
pub struct WorkerPool<W: PoolWorker> {
    inner: Arc<PoolInner<W>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<W: PoolWorker> WorkerPool<W> {
    /// Spin up `count` workers. Each worker runs the `on_init_thread` hook
    /// and acknowledges startup; `create` returns only once every worker has
    /// acknowledged. If any thread fails to spawn, the workers already
    /// started are told to exit and joined before the error is returned.
    pub fn create(count: usize, worker: W) -> io::Result<WorkerPool<W>> {
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a worker pool needs at least one worker",
            ));
        }

        let inner = Arc::new(PoolInner {
            worker,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                ready: false,
            }),
            sem: Semaphore::new(),
        });
        let ready_sem = Arc::new(Semaphore::new());

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(count);
        for idx in 0..count {
            let worker_inner = Arc::clone(&inner);
            let worker_ready = Arc::clone(&ready_sem);
            let spawned = thread::Builder::new()
                .name(format!("pool-{}", idx))
                .spawn(move || worker_main(worker_inner, worker_ready, idx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    {
                        let mut state = inner.state.lock().unwrap();
                        for _ in 0..handles.len() {
                            state.queue.push_front(Task::Exit);
                            inner.sem.post();
                        }
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        for _ in 0..count {
            ready_sem.wait();
        }
        inner.state.lock().unwrap().ready = true;

        Ok(WorkerPool {
            inner,
            threads: Mutex::new(handles),
        })
    }

    /// Queue a job. High-priority jobs are inserted at the front of the
    /// queue. Returns the job to the caller if the pool is not accepting
    /// work.
    pub fn post_request(&self, job: W::Job, high_priority: bool) -> Result<(), W::Job> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.ready {
            return Err(job);
        }
        if high_priority {
            state.queue.push_front(Task::Run(job));
        } else {
            state.queue.push_back(Task::Run(job));
        }
        // Posted with the queue still locked so the semaphore count and the
        // queue length stay in lockstep.
        self.inner.sem.post();
        Ok(())
    }

    /// The number of queued entries.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Stop accepting work, tell every worker to exit, and join them all.
    /// With `wait_drain` the exit markers queue behind all pending work;
    /// without it they jump the queue and only in-flight jobs complete.
    /// Calling `destroy` on an already-destroyed pool is a no-op.
    pub fn destroy(&self, wait_drain: bool) {
        let count = self.threads.lock().unwrap().len();
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.ready {
                return;
            }
            state.ready = false;
            for _ in 0..count {
                if wait_drain {
                    state.queue.push_back(Task::Exit);
                } else {
                    state.queue.push_front(Task::Exit);
                }
                self.inner.sem.post();
            }
        }

        let handles: Vec<JoinHandle<()>> =
            self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        // Without drain the exit markers jump ahead of queued work; drop
        // whatever the workers never picked up.
        self.inner.state.lock().unwrap().queue.clear();
    }
}

impl<W: PoolWorker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.destroy(false);
    }
}

fn worker_main<W: PoolWorker>(inner: Arc<PoolInner<W>>, ready: Arc<Semaphore>, idx: usize) {
    inner.worker.on_init_thread(idx);
    ready.post();

    loop {
        inner.sem.wait();
        let task = inner.state.lock().unwrap().queue.pop_front();
        match task {
            Some(Task::Run(job)) => inner.worker.on_job(idx, job),
            // The queue cannot be empty after a successful wait, but an
            // empty pop still means there is nothing to do.
            Some(Task::Exit) | None => break,
        }
    }

    inner.worker.on_exit_thread(idx);
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingWorker {
        started: AtomicUsize,
        finished: AtomicUsize,
        processed: AtomicUsize,
        delay: Duration,
    }

    impl CountingWorker {
        fn new(delay: Duration) -> CountingWorker {
            CountingWorker {
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl PoolWorker for Arc<CountingWorker> {
        type Job = usize;

        fn on_init_thread(&self, _idx: usize) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job(&self, _idx: usize, _job: usize) {
            if self.delay > Duration::from_millis(0) {
                thread::sleep(self.delay);
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exit_thread(&self, _idx: usize) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn create_and_destroy_runs_the_thread_hooks() {
        let worker = Arc::new(CountingWorker::new(Duration::from_millis(0)));
        let pool = WorkerPool::create(4, Arc::clone(&worker)).unwrap();
        assert_eq!(worker.started.load(Ordering::SeqCst), 4);
        pool.destroy(true);
        assert_eq!(worker.finished.load(Ordering::SeqCst), 4);
        assert_eq!(pool.queue_len(), 0);
        assert!(pool.post_request(1, false).is_err());
    }

    #[test]
    fn destroy_with_drain_completes_all_queued_work() {
        let worker = Arc::new(CountingWorker::new(Duration::from_millis(1)));
        let pool = WorkerPool::create(4, Arc::clone(&worker)).unwrap();
        for i in 0..100 {
            pool.post_request(i, false).unwrap();
        }
        pool.destroy(true);
        assert_eq!(worker.processed.load(Ordering::SeqCst), 100);
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn destroy_without_drain_abandons_queued_work() {
        let worker = Arc::new(CountingWorker::new(Duration::from_millis(30)));
        let pool = WorkerPool::create(4, Arc::clone(&worker)).unwrap();
        for i in 0..100 {
            pool.post_request(i, false).unwrap();
        }
        // Let the workers pick up their first jobs.
        thread::sleep(Duration::from_millis(10));
        pool.destroy(false);
        // Each worker finishes its in-flight job and may grab at most one
        // more that slipped ahead of the exit markers.
        assert!(worker.processed.load(Ordering::SeqCst) <= 8);
        assert_eq!(worker.finished.load(Ordering::SeqCst), 4);
    }

    struct RecordingWorker {
        order: Mutex<Vec<usize>>,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl PoolWorker for Arc<RecordingWorker> {
        type Job = usize;

        fn on_job(&self, _idx: usize, job: usize) {
            if job == 0 {
                // The gate job blocks the single worker until released.
                let rx = self.gate.lock().unwrap().take();
                if let Some(rx) = rx {
                    let _ = rx.recv();
                }
            }
            self.order.lock().unwrap().push(job);
        }
    }

    #[test]
    fn high_priority_requests_jump_the_queue() {
        let (tx, rx) = mpsc::channel();
        let worker = Arc::new(RecordingWorker {
            order: Mutex::new(Vec::new()),
            gate: Mutex::new(Some(rx)),
        });
        let pool = WorkerPool::create(1, Arc::clone(&worker)).unwrap();

        pool.post_request(0, false).unwrap(); // gate
        // Wait for the worker to be blocked inside the gate job so the
        // rest of the posts queue behind it deterministically.
        while pool.queue_len() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.post_request(1, false).unwrap();
        pool.post_request(2, false).unwrap();
        pool.post_request(3, true).unwrap();
        tx.send(()).unwrap();
        pool.destroy(true);

        assert_eq!(*worker.order.lock().unwrap(), vec![0, 3, 1, 2]);
    }
}
