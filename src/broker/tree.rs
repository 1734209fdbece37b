//! Broker tree bookkeeping: discovery snapshots and per-peer liveness.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Discovery snapshot of a module or broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub process_id: u32,
    pub is_broker: bool,
    pub module_id: u64,
}

impl ModuleInfo {
    /// Endpoint of the broker hosting the module.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.ip, self.port).parse().ok()
    }
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_broker { "broker" } else { "module" };
        write!(f, "{} {} at {}:{} (pid {})", kind, self.name, self.ip, self.port, self.process_id)
    }
}

/// Heartbeat bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Consecutive failed pings.
    pub try_number: u32,
    pub last_rtt: Duration,
    pub max_rtt: Duration,
    pub last_seen: Instant,
    pub reachable: bool,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            try_number: 0,
            last_rtt: Duration::ZERO,
            max_rtt: Duration::ZERO,
            last_seen: Instant::now(),
            reachable: true,
        }
    }
}

impl ConnectionInfo {
    /// Records a successful ping; returns true if the peer was unreachable until now.
    pub fn record_success(&mut self, rtt: Duration) -> bool {
        let recovered = !self.reachable;
        self.try_number = 0;
        self.last_rtt = rtt;
        self.max_rtt = self.max_rtt.max(rtt);
        self.last_seen = Instant::now();
        self.reachable = true;
        recovered
    }

    /// Records a failed ping; returns true when this failure makes the peer unreachable.
    pub fn record_failure(&mut self, max_retries: u32) -> bool {
        self.try_number += 1;
        if self.reachable && self.try_number >= max_retries {
            self.reachable = false;
            return true;
        }
        false
    }
}

/// A child broker registered with this one.
#[derive(Debug, Clone)]
pub struct ChildBroker {
    pub info: ModuleInfo,
    pub connection: ConnectionInfo,
}

impl ChildBroker {
    pub fn new(info: ModuleInfo) -> Self {
        Self {
            info,
            connection: ConnectionInfo::default(),
        }
    }
}
