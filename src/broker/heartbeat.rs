//! Heartbeat thread pinging the parent and child brokers.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error};

use super::BrokerHandle;
use crate::Result;

pub(crate) struct Heartbeat {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub(crate) fn start(broker: BrokerHandle, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("alcommon-heartbeat".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(next_interval(interval)) {
                    Err(RecvTimeoutError::Timeout) => match broker.upgrade() {
                        Ok(broker) => broker.check_heartbeat(),
                        Err(_) => break,
                    },
                    _ => break,
                }
            })?;
        debug!("Heartbeat started every {:?}", interval);
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stops the thread; does not wait when called from the heartbeat thread itself.
    pub(crate) fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Heartbeat thread panicked");
            }
        }
    }
}

/// Base interval jittered by ±5%.
fn next_interval(base: Duration) -> Duration {
    let jitter = rand::random_range(0..=10u32);
    base + (base * jitter) / 100 - base / 20
}
