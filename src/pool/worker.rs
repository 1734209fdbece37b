use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use super::{Shared, Task};

const IDLE_WAKEUP: Duration = Duration::from_secs(1);

/// Starts worker `id`. The worker owns nothing but its ID; all state lives in `shared`.
pub(super) fn spawn(shared: Arc<Shared>, id: usize) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("alcommon-worker-{}", id))
        .spawn(move || run(shared, id))
}

fn run(shared: Arc<Shared>, id: usize) {
    debug!("Worker {} started", id);
    while let Some(mut task) = next_task(&shared, id) {
        shared.used.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("alcommon.pool.used_threads").increment(1.0);
        debug!("Worker {} executing task {}", id, task.id());
        let start = Instant::now();
        task.run(Some(id));
        debug!("Worker {} finished task {} in {:?}", id, task.id(), start.elapsed());
        shared.used.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("alcommon.pool.used_threads").decrement(1.0);
        shared.task_ended(task);
        if shared.apoptosis(id) {
            return;
        }
    }
    debug!("Worker {} stopped", id);
}

/// Blocks until a task is available; `None` means the worker must exit.
fn next_task(shared: &Shared, id: usize) -> Option<Task> {
    let mut state = shared.state.lock();
    loop {
        if state.superfluous > 0 {
            state.superfluous -= 1;
            state.retire(id);
            debug!("Worker {} retired while idle", id);
            return None;
        }
        if let Some(task) = state.queue.pop_front() {
            return Some(task);
        }
        if state.stopping.is_some() {
            state.retire(id);
            return None;
        }

        state.idle += 1;
        if let Some(slot) = state.workers.get_mut(&id) {
            slot.idle_since = Some(Instant::now());
        }
        shared.work_available.wait_for(&mut state, IDLE_WAKEUP);
        state.idle -= 1;
        if let Some(slot) = state.workers.get_mut(&id) {
            if let Some(since) = slot.idle_since.take() {
                slot.idle_sum += since.elapsed();
            }
        }
    }
}
