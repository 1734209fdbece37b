//! Registry of in-flight asynchronous calls.
//!
//! An entry is added before its task becomes visible to the pool and removed when the
//! [`MonitoredSection`] guard is dropped, whether the task ran or was discarded unrun.
//! Every removal wakes all waiters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::context::CancelToken;
use crate::TaskId;

/// Snapshot of one monitored task.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub id: TaskId,
    pub module: String,
    pub method: String,
    pub thread: Option<usize>,
    cancel: CancelToken,
}

impl TaskEntry {
    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    removed: Condvar,
}

#[derive(Clone, Default)]
pub struct TaskMonitor {
    inner: Arc<Inner>,
}

/// Removes its entry from the monitor when dropped.
#[must_use = "the task is unmonitored as soon as the section is dropped"]
pub struct MonitoredSection {
    monitor: TaskMonitor,
    id: TaskId,
}

impl MonitoredSection {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Records the worker running the task.
    pub fn set_thread(&self, worker: Option<usize>) {
        self.monitor.set_thread(self.id, worker);
    }
}

impl Drop for MonitoredSection {
    fn drop(&mut self) {
        self.monitor.remove(self.id);
    }
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task and returns its cancel token with the guard owning the entry.
    pub fn add(&self, id: TaskId, module: &str, method: &str) -> (MonitoredSection, CancelToken) {
        let cancel = CancelToken::new();
        let entry = TaskEntry {
            id,
            module: module.to_string(),
            method: method.to_string(),
            thread: None,
            cancel: cancel.clone(),
        };
        self.inner.tasks.lock().insert(id, entry);
        debug!("Monitoring task {} ({}.{})", id, module, method);
        (
            MonitoredSection {
                monitor: self.clone(),
                id,
            },
            cancel,
        )
    }

    pub fn remove(&self, id: TaskId) -> bool {
        let removed = self.inner.tasks.lock().remove(&id).is_some();
        if removed {
            debug!("Task {} no longer monitored", id);
            self.inner.removed.notify_all();
        }
        removed
    }

    pub fn set_thread(&self, id: TaskId, worker: Option<usize>) {
        if let Some(entry) = self.inner.tasks.lock().get_mut(&id) {
            entry.thread = worker;
        }
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.inner.tasks.lock().contains_key(&id)
    }

    pub fn is_method_running(&self, method: &str) -> bool {
        self.inner.tasks.lock().values().any(|e| e.method == method)
    }

    /// Waits for task `id` to end. Returns true on timeout; `timeout_ms == 0` waits forever.
    pub fn wait(&self, id: TaskId, timeout_ms: u64) -> bool {
        self.wait_until(timeout_ms, |tasks| !tasks.contains_key(&id))
    }

    /// Waits until no task of `method` is in flight. Same timeout contract as [`TaskMonitor::wait`].
    pub fn wait_method(&self, method: &str, timeout_ms: u64) -> bool {
        self.wait_until(timeout_ms, |tasks| !tasks.values().any(|e| e.method == method))
    }

    fn wait_until<F>(&self, timeout_ms: u64, done: F) -> bool
    where
        F: Fn(&HashMap<TaskId, TaskEntry>) -> bool,
    {
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let mut tasks = self.inner.tasks.lock();
        while !done(&tasks) {
            match deadline {
                None => self.inner.removed.wait(&mut tasks),
                Some(deadline) => {
                    if self.inner.removed.wait_until(&mut tasks, deadline).timed_out() {
                        return !done(&tasks);
                    }
                }
            }
        }
        false
    }

    pub fn is_stop_requested(&self, id: TaskId) -> bool {
        self.inner
            .tasks
            .lock()
            .get(&id)
            .map(TaskEntry::is_stop_requested)
            .unwrap_or(false)
    }

    /// Flags task `id` for cooperative cancellation; returns its module name if it is in flight.
    pub fn request_stop(&self, id: TaskId) -> Option<String> {
        let tasks = self.inner.tasks.lock();
        let entry = tasks.get(&id)?;
        entry.cancel.cancel();
        debug!("Stop requested for task {}", id);
        Some(entry.module.clone())
    }

    /// Flags every in-flight task of `method`; returns the affected (task, module) pairs.
    pub fn request_stop_method(&self, method: &str) -> Vec<(TaskId, String)> {
        let tasks = self.inner.tasks.lock();
        tasks
            .values()
            .filter(|e| e.method == method)
            .map(|e| {
                e.cancel.cancel();
                (e.id, e.module.clone())
            })
            .collect()
    }

    pub fn task_list(&self) -> Vec<TaskEntry> {
        let mut list: Vec<TaskEntry> = self.inner.tasks.lock().values().cloned().collect();
        list.sort_by_key(|e| e.id.0);
        list
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMonitor").field("tasks", &self.len()).finish()
    }
}
