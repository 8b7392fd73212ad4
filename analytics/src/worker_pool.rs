//! Fixed-ceiling worker pool with per-task completion handles
//!
//! Workers are spawned lazily, up to `max_threads`, when no idle worker can
//! take a new task; beyond the ceiling tasks queue in FIFO order. A panic
//! inside a task is captured on that task's handle and never takes the
//! worker down. A pool built with `bounded` refuses tasks once its queue
//! holds `max_queue` waiting tasks.

use crate::error::{AnalyticsError, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
    spawned: usize,
    quit: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completion handle returned by `WorkerPool::submit`
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finished (or was discarded by shutdown)
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .unwrap_or(Err(AnalyticsError::TaskCancelled))
    }

    /// Wait at most `timeout`; `None` if the task is still pending
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(AnalyticsError::TaskCancelled)),
        }
    }

    /// Non-blocking poll
    pub fn try_result(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(AnalyticsError::TaskCancelled)),
        }
    }
}

/// Pool of worker threads consuming a shared FIFO task queue
pub struct WorkerPool {
    name: String,
    max_threads: usize,
    max_queue: Option<usize>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create an empty pool with an unbounded queue; threads are started on demand
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        Self::with_queue_limit(name, max_threads, None)
    }

    /// Pool whose queue holds at most `max_queue` waiting tasks (minimum 1)
    pub fn bounded(name: impl Into<String>, max_threads: usize, max_queue: usize) -> Self {
        Self::with_queue_limit(name, max_threads, Some(max_queue.max(1)))
    }

    fn with_queue_limit(
        name: impl Into<String>,
        max_threads: usize,
        max_queue: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            max_threads: max_threads.max(1),
            max_queue,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    idle: 0,
                    spawned: 0,
                    quit: false,
                }),
                available: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn max_queue(&self) -> Option<usize> {
        self.max_queue
    }

    /// Number of worker threads started so far
    pub fn thread_count(&self) -> usize {
        self.shared.lock().spawned
    }

    /// Tasks waiting for a worker
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().quit
    }

    /// Queue a task and return its completion handle
    ///
    /// Fails with `QueueFull` when a bounded queue is at its limit; the task
    /// is dropped without running.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| AnalyticsError::TaskPanicked(panic_message(payload)));
            let _ = tx.send(outcome);
        });

        let mut state = self.shared.lock();
        if state.quit {
            return Err(AnalyticsError::PoolShutdown);
        }
        if let Some(limit) = self.max_queue {
            if state.queue.len() >= limit {
                return Err(AnalyticsError::QueueFull {
                    pool: self.name.clone(),
                    limit,
                });
            }
        }
        state.queue.push_back(job);

        if state.queue.len() > state.idle && state.spawned < self.max_threads {
            if let Err(e) = self.spawn_worker(state.spawned) {
                if state.spawned == 0 {
                    state.queue.pop_back();
                    return Err(e);
                }
                log::warn!("{}: failed to start extra worker: {}", self.name, e);
            } else {
                state.spawned += 1;
            }
        }
        drop(state);

        self.shared.available.notify_one();
        Ok(TaskHandle { rx })
    }

    fn spawn_worker(&self, worker_id: usize) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let pool_name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, worker_id))
            .spawn(move || Self::worker_loop(shared, pool_name, worker_id))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn worker_loop(shared: Arc<Shared>, pool_name: String, worker_id: usize) {
        log::debug!("{} worker {} started", pool_name, worker_id);

        loop {
            let job = {
                let mut state = shared.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        break Some(job);
                    }
                    if state.quit {
                        break None;
                    }
                    state.idle += 1;
                    state = shared
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                    state.idle -= 1;
                }
            };

            match job {
                Some(job) => job(),
                None => break,
            }
        }

        log::debug!("{} worker {} stopped", pool_name, worker_id);
    }

    /// Stop accepting work, discard queued tasks and join every worker
    ///
    /// Tasks already running finish first; their handles still resolve.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.shared.lock();
            state.quit = true;
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        self.shared.available.notify_all();

        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if handles.is_empty() && discarded == 0 {
            return;
        }

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("{}: worker exited abnormally", self.name);
            }
        }

        log::debug!(
            "{} shut down ({} queued tasks discarded)",
            self.name,
            discarded
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
