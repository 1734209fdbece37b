//! Per-call context handed to bound methods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broker::{Broker, BrokerHandle};
use crate::{BrokerError, Result, TaskId};

/// Cooperative cancellation flag shared between the task monitor and a running task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a bound method can see about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    module: String,
    method: String,
    task: Option<TaskId>,
    cancel: CancelToken,
    broker: Option<BrokerHandle>,
}

impl CallContext {
    /// Context of a synchronous call; never cancelled.
    pub fn sync(module: &str, method: &str, broker: Option<BrokerHandle>) -> Self {
        Self {
            module: module.to_string(),
            method: method.to_string(),
            task: None,
            cancel: CancelToken::new(),
            broker,
        }
    }

    /// Context of a pool task started by `pcall`.
    pub fn task(
        module: &str,
        method: &str,
        id: TaskId,
        cancel: CancelToken,
        broker: Option<BrokerHandle>,
    ) -> Self {
        Self {
            module: module.to_string(),
            method: method.to_string(),
            task: Some(id),
            cancel,
            broker,
        }
    }

    /// Detached context, used when a module is driven without a broker.
    pub fn detached(module: &str, method: &str) -> Self {
        Self::sync(module, method, None)
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with `StopRequested` once a stop has been requested for this task.
    pub fn check_stop(&self) -> Result<()> {
        match (self.task, self.cancel.is_cancelled()) {
            (Some(id), true) => Err(BrokerError::StopRequested(id)),
            _ => Ok(()),
        }
    }

    /// The broker serving this call, if it is still alive.
    pub fn broker(&self) -> Result<Broker> {
        self.broker
            .as_ref()
            .ok_or_else(|| BrokerError::Internal("call has no broker".to_string()))?
            .upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_stop() {
        let token = CancelToken::new();
        let ctx = CallContext::task("m", "f", TaskId(3), token.clone(), None);
        assert!(ctx.check_stop().is_ok());
        token.cancel();
        assert!(ctx.is_stop_requested());
        assert!(matches!(ctx.check_stop(), Err(BrokerError::StopRequested(TaskId(3)))));
        assert!(ctx.broker().is_err());
    }
}
