//! alcommon - module broker with local and remote method dispatch
//!
//! A [`Broker`] owns a registry of [`Module`]s, a self-resizing [`ThreadPool`] and a
//! [`TaskMonitor`]. Callers reach module methods through a [`Proxy`], either directly on
//! their own thread (`call`) or asynchronously on the pool (`pcall` + `wait`). Brokers
//! link into a parent/child tree with discovery and heartbeat.

pub mod broker;
pub mod context;
pub mod functor;
pub mod module;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod task_monitor;
pub mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Broker-issued identifier of an asynchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Error kinds carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MethodNotFound,
    ArityMismatch,
    TypeMismatch,
    ModuleUnreachable,
    ConnectionLost,
    Timeout,
    StopRequested,
    Internal,
}

/// Broker error type
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("arity mismatch: {0}")]
    ArityMismatch(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("module unreachable: {0}")]
    ModuleUnreachable(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("stop requested for task {0}")]
    StopRequested(TaskId),

    #[error("method '{0}' is already bound")]
    DuplicateMethod(String),

    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("broker is shutting down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            BrokerError::ArityMismatch(_) => ErrorKind::ArityMismatch,
            BrokerError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            BrokerError::ModuleUnreachable(_) => ErrorKind::ModuleUnreachable,
            BrokerError::ConnectionLost(_) | BrokerError::Io(_) => ErrorKind::ConnectionLost,
            BrokerError::Timeout(_) => ErrorKind::Timeout,
            BrokerError::StopRequested(_) => ErrorKind::StopRequested,
            _ => ErrorKind::Internal,
        }
    }

    /// Rebuilds an error reported by a peer broker.
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::MethodNotFound => BrokerError::MethodNotFound(message),
            ErrorKind::ArityMismatch => BrokerError::ArityMismatch(message),
            ErrorKind::TypeMismatch => BrokerError::TypeMismatch(message),
            ErrorKind::ModuleUnreachable => BrokerError::ModuleUnreachable(message),
            ErrorKind::ConnectionLost => BrokerError::ConnectionLost(message),
            ErrorKind::Timeout => BrokerError::Timeout(message),
            // the remote task id is not meaningful to the caller
            ErrorKind::StopRequested => BrokerError::StopRequested(TaskId(0)),
            ErrorKind::Internal => BrokerError::Internal(message),
        }
    }

    /// Message without the kind prefix, as sent to peers.
    pub fn message(&self) -> String {
        match self {
            BrokerError::MethodNotFound(m)
            | BrokerError::ArityMismatch(m)
            | BrokerError::TypeMismatch(m)
            | BrokerError::ModuleUnreachable(m)
            | BrokerError::ConnectionLost(m)
            | BrokerError::Timeout(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

pub use broker::{Broker, BrokerConfig, BrokerFlags, BrokerHandle, ModuleInfo, ShutdownMode};
pub use context::{CallContext, CancelToken};
pub use functor::{Args, Functor, MethodReturn, ReturnValue};
pub use module::{MethodDescriptor, Module};
pub use pool::{PoolConfig, ThreadPool};
pub use proxy::Proxy;
pub use task_monitor::TaskMonitor;
pub use value::{Binary, TypeTag, Value, ValueKind, ValueType};
