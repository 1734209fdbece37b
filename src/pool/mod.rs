//! Self-resizing worker thread pool.
//!
//! Workers block on one shared condition until a task is queued. After each task a
//! worker asks the pool whether it is superfluous (`apoptosis`) and exits if so. The
//! [`monitor`] decides when to grow or shrink; `adjust_thread` is the only resize path.

mod monitor;
pub mod task;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::{BrokerError, Result, TaskId};
use monitor::Monitor;
pub use task::{Job, Task, TaskReport, TaskState};

const MAX_REPORTS: usize = 1024;

/// How a pool (or broker) stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run every queued task, then join the workers.
    Drain,
    /// Drop queued tasks and detach running workers without waiting.
    Kill,
}

/// Pool sizing and monitor policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_threads: usize,
    pub max_threads: usize,
    /// Enqueues between two monitor passes.
    pub update_cycle: u64,
    /// Idle percentage above which the pool shrinks.
    pub update_threshold: u32,
    /// Threads added or removed per adjustment.
    pub update_offset: usize,
    /// Period of the background monitor pass; 0 disables it.
    pub monitor_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            initial_threads: cores,
            max_threads: cores * 2,
            update_cycle: 32,
            update_threshold: 50,
            update_offset: 2,
            monitor_interval_ms: 500,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_threads == 0 {
            return Err(BrokerError::Config("initial_threads must be at least 1".into()));
        }
        if self.max_threads < self.initial_threads {
            return Err(BrokerError::Config(format!(
                "max_threads ({}) is below initial_threads ({})",
                self.max_threads, self.initial_threads
            )));
        }
        if self.update_cycle == 0 || self.update_offset == 0 {
            return Err(BrokerError::Config("update_cycle and update_offset must be positive".into()));
        }
        if self.update_threshold > 100 {
            return Err(BrokerError::Config("update_threshold is a percentage".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct WorkerSlot {
    handle: Option<JoinHandle<()>>,
    idle_since: Option<Instant>,
    idle_sum: Duration,
}

struct PoolState {
    queue: VecDeque<Task>,
    workers: HashMap<usize, WorkerSlot>,
    next_worker_id: usize,
    superfluous: usize,
    idle: usize,
    stopping: Option<ShutdownMode>,
    reports: VecDeque<TaskReport>,
}

impl PoolState {
    fn retire(&mut self, id: usize) {
        self.workers.remove(&id);
    }

    fn active_threads(&self) -> usize {
        self.workers.len().saturating_sub(self.superfluous)
    }
}

/// Snapshot used by the monitor.
pub(crate) struct PoolSample {
    pub threads: usize,
    pub idle_threads: usize,
    pub queued: usize,
    pub idle_sum: Duration,
}

pub(crate) struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_available: Condvar,
    used: AtomicUsize,
    enqueued: AtomicU64,
    monitor: Mutex<Monitor>,
}

impl Shared {
    fn spawn_workers(self: &Arc<Self>, state: &mut PoolState, count: usize) -> usize {
        let mut spawned = 0;
        for _ in 0..count {
            let id = state.next_worker_id;
            state.next_worker_id += 1;
            match worker::spawn(self.clone(), id) {
                Ok(handle) => {
                    state.workers.insert(
                        id,
                        WorkerSlot {
                            handle: Some(handle),
                            ..WorkerSlot::default()
                        },
                    );
                    spawned += 1;
                }
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", id, e);
                    break;
                }
            }
        }
        metrics::gauge!("alcommon.pool.threads").set(state.workers.len() as f64);
        spawned
    }

    /// Grows (`n > 0`) or shrinks (`n < 0`) the pool.
    fn adjust_thread(self: &Arc<Self>, n: isize) -> bool {
        let mut state = self.state.lock();
        if state.stopping.is_some() || n == 0 {
            return false;
        }
        let current = state.active_threads() as isize;
        let target = current + n;
        if target < 1 || target > self.config.max_threads as isize {
            debug!("Pool adjustment {} refused ({} threads)", n, current);
            return false;
        }
        if n > 0 {
            // pending retirements are cancelled before any new thread is spawned
            let wanted = n as usize;
            let kept = wanted.min(state.superfluous);
            state.superfluous -= kept;
            let spawned = if wanted > kept {
                self.spawn_workers(&mut state, wanted - kept)
            } else {
                0
            };
            info!(
                "Pool grown by {} ({} kept, {} spawned) to {} threads",
                kept + spawned,
                kept,
                spawned,
                state.active_threads()
            );
            kept + spawned > 0
        } else {
            state.superfluous += n.unsigned_abs();
            self.work_available.notify_all();
            info!("Pool shrinking by {} from {} threads", n.unsigned_abs(), current);
            true
        }
    }

    /// Called by a worker after each task; true means the worker must exit.
    pub(crate) fn apoptosis(&self, id: usize) -> bool {
        let mut state = self.state.lock();
        if state.superfluous > 0 {
            state.superfluous -= 1;
            state.retire(id);
            metrics::gauge!("alcommon.pool.threads").set(state.workers.len() as f64);
            debug!("Worker {} retired", id);
            return true;
        }
        false
    }

    pub(crate) fn task_ended(&self, task: Task) {
        let report = task.report();
        metrics::histogram!("alcommon.pool.task_seconds").record(report.execution.as_secs_f64());
        debug!(
            "Task {} ({}) ended after {:?} queued, {:?} running",
            report.id, report.name, report.idle, report.execution
        );
        if !task.auto_delete {
            let mut state = self.state.lock();
            if state.reports.len() == MAX_REPORTS {
                state.reports.pop_front();
            }
            state.reports.push_back(report);
        }
    }

    /// Sums idle time of every worker, including idle periods still in progress,
    /// and restarts the accounting.
    pub(crate) fn sample(&self, reset: bool) -> PoolSample {
        let mut state = self.state.lock();
        let now = Instant::now();
        let mut idle_sum = Duration::ZERO;
        for slot in state.workers.values_mut() {
            idle_sum += slot.idle_sum;
            if let Some(since) = slot.idle_since {
                idle_sum += now.saturating_duration_since(since);
                if reset {
                    slot.idle_since = Some(now);
                }
            }
            if reset {
                slot.idle_sum = Duration::ZERO;
            }
        }
        PoolSample {
            threads: state.active_threads(),
            idle_threads: state.idle,
            queued: state.queue.len(),
            idle_sum,
        }
    }

    fn run_monitor(self: &Arc<Self>) {
        // a pass already in progress covers this one
        let Some(mut monitor) = self.monitor.try_lock() else {
            return;
        };
        if let Some(delta) = monitor.cycle(self, &self.config) {
            self.adjust_thread(delta);
        }
    }
}

/// Bounded, self-resizing pool of worker threads.
pub struct ThreadPool {
    shared: Arc<Shared>,
    monitor_stop: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: HashMap::new(),
                next_worker_id: 0,
                superfluous: 0,
                idle: 0,
                stopping: None,
                reports: VecDeque::new(),
            }),
            work_available: Condvar::new(),
            used: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            monitor: Mutex::new(Monitor::new()),
            config,
        });
        {
            let mut state = shared.state.lock();
            let initial = shared.config.initial_threads;
            if shared.spawn_workers(&mut state, initial) == 0 {
                return Err(BrokerError::Internal("could not start any worker thread".into()));
            }
        }
        let pool = Self {
            monitor_stop: Mutex::new(None),
            shared,
        };
        pool.start_monitor()?;
        info!(
            "Thread pool started with {} threads (max {})",
            pool.shared.config.initial_threads, pool.shared.config.max_threads
        );
        Ok(pool)
    }

    fn start_monitor(&self) -> Result<()> {
        let interval = Duration::from_millis(self.shared.config.monitor_interval_ms);
        if interval.is_zero() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("alcommon-pool-monitor".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => shared.run_monitor(),
                    _ => break,
                }
            })?;
        *self.monitor_stop.lock() = Some((stop_tx, handle));
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Queues a task and wakes a worker. The task ID is fixed before any worker can see it.
    pub fn enqueue(&self, task: Task) -> Result<TaskId> {
        let id = task.id();
        {
            let mut state = self.shared.state.lock();
            if state.stopping.is_some() {
                return Err(BrokerError::Shutdown);
            }
            state.queue.push_back(task);
            if state.idle > 0 {
                self.shared.work_available.notify_one();
            } else {
                self.shared.work_available.notify_all();
            }
        }
        metrics::counter!("alcommon.pool.tasks_enqueued").increment(1);
        let count = self.shared.enqueued.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.shared.config.update_cycle == 0 {
            self.shared.run_monitor();
        }
        Ok(id)
    }

    /// Grows (`n > 0`) or shrinks (`n < 0`) the pool; refused outside `1..=max_threads`.
    pub fn adjust_thread(&self, n: isize) -> bool {
        self.shared.adjust_thread(n)
    }

    /// Forces a monitor pass.
    pub fn run_monitor(&self) {
        self.shared.run_monitor();
    }

    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().active_threads()
    }

    pub fn used_threads(&self) -> usize {
        self.shared.used.load(Ordering::Acquire)
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn compute_idle_sum(&self) -> Duration {
        self.shared.sample(false).idle_sum
    }

    pub fn reset_idle_sum(&self) {
        self.shared.sample(true);
    }

    /// Reports of ended tasks created with `auto_delete == false`.
    pub fn take_reports(&self) -> Vec<TaskReport> {
        self.shared.state.lock().reports.drain(..).collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.state.lock().stopping.is_some()
    }

    /// Stops the pool. Idempotent.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let (handles, dropped) = {
            let mut state = self.shared.state.lock();
            if state.stopping.is_some() {
                return;
            }
            state.stopping = Some(mode);
            let dropped: Vec<Task> = match mode {
                ShutdownMode::Kill => state.queue.drain(..).collect(),
                ShutdownMode::Drain => Vec::new(),
            };
            let handles: Vec<JoinHandle<()>> = state
                .workers
                .values_mut()
                .filter_map(|slot| slot.handle.take())
                .collect();
            self.shared.work_available.notify_all();
            (handles, dropped)
        };
        if !dropped.is_empty() {
            info!("Thread pool dropping {} queued tasks", dropped.len());
        }
        // outside the lock: dropping a task releases whatever its job holds
        drop(dropped);

        if let Some((stop_tx, handle)) = self.monitor_stop.lock().take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }

        match mode {
            ShutdownMode::Drain => {
                let me = thread::current().id();
                for handle in handles {
                    if handle.thread().id() == me {
                        continue;
                    }
                    if handle.join().is_err() {
                        error!("A worker thread panicked during shutdown");
                    }
                }
                info!("Thread pool drained");
            }
            ShutdownMode::Kill => info!("Thread pool killed"),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Kill);
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.thread_count())
            .field("used", &self.used_threads())
            .field("queued", &self.queued_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(initial: usize, max: usize) -> PoolConfig {
        PoolConfig {
            initial_threads: initial,
            max_threads: max,
            update_cycle: 1000,
            update_threshold: 50,
            update_offset: 1,
            monitor_interval_ms: 0,
        }
    }

    #[test]
    fn test_runs_tasks() {
        let pool = ThreadPool::new(config(2, 4)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let counter = counter.clone();
            pool.enqueue(Task::new(
                TaskId(i),
                "count",
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            ))
            .unwrap();
        }
        pool.shutdown(ShutdownMode::Drain);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.enqueue(Task::new(TaskId(99), "late", Box::new(|_| ()))).is_err());
    }

    #[test]
    fn test_adjust_bounds() {
        let pool = ThreadPool::new(config(2, 3)).unwrap();
        assert!(pool.adjust_thread(1));
        assert_eq!(pool.thread_count(), 3);
        assert!(!pool.adjust_thread(1));
        assert!(pool.adjust_thread(-2));
        assert_eq!(pool.thread_count(), 1);
        assert!(!pool.adjust_thread(-1));
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn test_grow_cancels_pending_retirements() {
        let pool = ThreadPool::new(config(2, 4)).unwrap();
        assert!(pool.adjust_thread(2));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let started = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let gate_rx = gate_rx.clone();
            let started = started.clone();
            pool.enqueue(Task::new(
                TaskId(i),
                "block",
                Box::new(move |_| {
                    started.fetch_add(1, Ordering::SeqCst);
                    let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                }),
            ))
            .unwrap();
        }
        while started.load(Ordering::SeqCst) < 4 {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(pool.adjust_thread(-2));
        assert_eq!(pool.thread_count(), 2);
        assert!(pool.adjust_thread(2));
        {
            let state = pool.shared.state.lock();
            assert_eq!(state.superfluous, 0);
            assert_eq!(state.workers.len(), 4);
            assert_eq!(state.next_worker_id, 4);
        }
        assert_eq!(pool.thread_count(), 4);

        drop(gate_tx);
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn test_reports_kept_without_auto_delete() {
        let pool = ThreadPool::new(config(1, 1)).unwrap();
        let mut task = Task::new(TaskId(7), "kept", Box::new(|_| ()));
        task.auto_delete = false;
        pool.enqueue(task).unwrap();
        pool.enqueue(Task::new(TaskId(8), "gone", Box::new(|_| ()))).unwrap();
        pool.shutdown(ShutdownMode::Drain);
        let reports = pool.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, TaskId(7));
    }

    #[test]
    fn test_kill_drops_queue() {
        let pool = ThreadPool::new(config(1, 1)).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        pool.enqueue(Task::new(
            TaskId(1),
            "block",
            Box::new(move |_| {
                let _ = gate_rx.recv_timeout(Duration::from_secs(2));
            }),
        ))
        .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        pool.enqueue(Task::new(
            TaskId(2),
            "never",
            Box::new(move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
        ))
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        pool.shutdown(ShutdownMode::Kill);
        drop(gate_tx);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_config() {
        assert!(ThreadPool::new(config(0, 1)).is_err());
        assert!(ThreadPool::new(config(3, 2)).is_err());
    }
}
