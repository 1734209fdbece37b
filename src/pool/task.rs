//! Unit of work executed by the pool.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::TaskId;

/// Work carried by a task; receives the executing worker's ID (`None` outside the pool).
pub type Job = Box<dyn FnOnce(Option<usize>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Ended,
}

/// One asynchronous call waiting for or running on a worker.
pub struct Task {
    id: TaskId,
    name: String,
    state: TaskState,
    created: Instant,
    started: Option<Instant>,
    ended: Option<Instant>,
    panicked: bool,
    /// When false the pool keeps a [`TaskReport`] after the task ends.
    pub auto_delete: bool,
    job: Option<Job>,
}

/// Timing summary of an ended task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub idle: Duration,
    pub execution: Duration,
    pub panicked: bool,
}

impl Task {
    pub fn new(id: TaskId, name: impl Into<String>, job: Job) -> Self {
        Self {
            id,
            name: name.into(),
            state: TaskState::Idle,
            created: Instant::now(),
            started: None,
            ended: None,
            panicked: false,
            auto_delete: true,
            job: Some(job),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Time spent queued before a worker picked the task up.
    pub fn idle_time(&self) -> Duration {
        match self.started {
            Some(started) => started - self.created,
            None => self.created.elapsed(),
        }
    }

    pub fn execution_time(&self) -> Duration {
        match (self.started, self.ended) {
            (Some(started), Some(ended)) => ended - started,
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Runs the job once. A panic is caught here so it cannot take the worker down.
    pub fn run(&mut self, worker: Option<usize>) {
        let Some(job) = self.job.take() else {
            return;
        };
        self.state = TaskState::Running;
        self.started = Some(Instant::now());
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || job(worker))) {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Task {} ({}) panicked: {}", self.id, self.name, reason);
            self.panicked = true;
        }
        self.ended = Some(Instant::now());
        self.state = TaskState::Ended;
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            id: self.id,
            name: self.name.clone(),
            idle: self.idle_time(),
            execution: self.execution_time(),
            panicked: self.panicked,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("auto_delete", &self.auto_delete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_records_state_and_worker() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let mut task = Task::new(
            TaskId(1),
            "m.f",
            Box::new(move |worker| seen2.store(worker.unwrap_or(0) + 10, Ordering::SeqCst)),
        );
        assert_eq!(task.state(), TaskState::Idle);
        task.run(Some(3));
        assert_eq!(task.state(), TaskState::Ended);
        assert_eq!(seen.load(Ordering::SeqCst), 13);
        assert!(!task.report().panicked);
    }

    #[test]
    fn test_panic_is_contained() {
        let mut task = Task::new(TaskId(2), "m.boom", Box::new(|_| panic!("boom")));
        task.run(None);
        assert_eq!(task.state(), TaskState::Ended);
        assert!(task.report().panicked);
    }
}
