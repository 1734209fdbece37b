use std::time::Instant;

use log::debug;

use super::{PoolConfig, Shared};

/// Number of consecutive backlogged passes before the pool grows.
const BACKLOG_CYCLES: u32 = 2;

/// Resize policy. Each pass looks at the idle ratio since the previous pass and at the backlog.
pub(super) struct Monitor {
    last_cycle: Instant,
    backlog_cycles: u32,
}

impl Monitor {
    pub(super) fn new() -> Self {
        Self {
            last_cycle: Instant::now(),
            backlog_cycles: 0,
        }
    }

    /// Returns the thread delta to apply, if any.
    pub(super) fn cycle(&mut self, shared: &Shared, config: &PoolConfig) -> Option<isize> {
        let elapsed = self.last_cycle.elapsed();
        self.last_cycle = Instant::now();
        let sample = shared.sample(true);
        if sample.threads == 0 || elapsed.is_zero() {
            return None;
        }

        let capacity = elapsed.as_secs_f64() * sample.threads as f64;
        let idle_percent = (sample.idle_sum.as_secs_f64() / capacity * 100.0).min(100.0);
        metrics::gauge!("alcommon.pool.idle_percent").set(idle_percent);

        if sample.queued > sample.idle_threads {
            self.backlog_cycles += 1;
        } else {
            self.backlog_cycles = 0;
        }
        debug!(
            "Pool monitor: {} threads, {} idle, {} queued, {:.1}% idle, backlog {}",
            sample.threads, sample.idle_threads, sample.queued, idle_percent, self.backlog_cycles
        );

        if self.backlog_cycles >= BACKLOG_CYCLES {
            self.backlog_cycles = 0;
            let room = config.max_threads.saturating_sub(sample.threads);
            let grow = config.update_offset.min(room);
            return (grow > 0).then_some(grow as isize);
        }

        if sample.queued == 0 && idle_percent > config.update_threshold as f64 {
            let excess = sample.threads.saturating_sub(config.initial_threads);
            let shrink = config.update_offset.min(excess);
            return (shrink > 0).then_some(-(shrink as isize));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ShutdownMode, Task, ThreadPool};
    use crate::TaskId;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;

    fn config() -> PoolConfig {
        PoolConfig {
            initial_threads: 1,
            max_threads: 3,
            update_cycle: 1000,
            update_threshold: 50,
            update_offset: 1,
            monitor_interval_ms: 0,
        }
    }

    #[test]
    fn test_grows_under_backlog_and_respects_max() {
        let pool = ThreadPool::new(config()).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        for i in 0..8 {
            let gate_rx = gate_rx.clone();
            pool.enqueue(Task::new(
                TaskId(i),
                "block",
                Box::new(move |_| {
                    let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                }),
            ))
            .unwrap();
        }
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(5));
            pool.run_monitor();
            assert!(pool.thread_count() <= 3);
        }
        assert_eq!(pool.thread_count(), 3);
        drop(gate_tx);
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn test_shrinks_back_to_initial_when_idle() {
        let pool = ThreadPool::new(config()).unwrap();
        assert!(pool.adjust_thread(2));
        assert_eq!(pool.thread_count(), 3);
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(20));
            pool.run_monitor();
        }
        assert_eq!(pool.thread_count(), 1);
        pool.shutdown(ShutdownMode::Drain);
    }
}
