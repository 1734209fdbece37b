//! Broker configuration.
//!
//! Everything has a default, so a JSON file only needs the keys it changes:
//!
//! ```json
//! { "name": "child", "port": 0, "parent": "127.0.0.1:9559", "flags": { "keepalive": true } }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::PoolConfig;
use crate::{BrokerError, Result};

pub const DEFAULT_PORT: u16 = 9559;

/// Broker behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerFlags {
    /// Survive the loss of the parent broker.
    pub keepalive: bool,
    /// No thread pool: each `pcall` gets its own thread.
    pub light: bool,
    /// Do not listen for remote peers.
    pub noserver: bool,
}

impl BrokerFlags {
    pub const KEEPALIVE: u32 = 1;
    pub const LIGHT: u32 = 2;
    pub const NOSERVER: u32 = 4;

    /// Parses the legacy bit mask.
    pub fn from_mask(mask: u32) -> Self {
        Self {
            keepalive: mask & Self::KEEPALIVE != 0,
            light: mask & Self::LIGHT != 0,
            noserver: mask & Self::NOSERVER != 0,
        }
    }

    pub fn mask(&self) -> u32 {
        (self.keepalive as u32) * Self::KEEPALIVE
            | (self.light as u32) * Self::LIGHT
            | (self.noserver as u32) * Self::NOSERVER
    }
}

/// Liveness checks of parent and children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Base ping period; each tick is jittered by ±5%.
    pub interval_ms: u64,
    /// Consecutive failed pings before a peer is unreachable.
    pub max_retries: u32,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            max_retries: 5,
            timeout_ms: 2000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Where `get_module_by_name` looks after the local registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub search_up: bool,
    pub search_down: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            search_up: true,
            search_down: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub name: String,
    pub ip: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    /// `ip:port` of the parent broker.
    pub parent: Option<String>,
    pub flags: BrokerFlags,
    pub pool: PoolConfig,
    pub heartbeat: HeartbeatConfig,
    pub discovery: DiscoveryConfig,
    pub connect_timeout_ms: u64,
    /// Upper bound on a remote call; `None` waits as long as the callee runs.
    pub call_timeout_ms: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "broker".to_string(),
            ip: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            parent: None,
            flags: BrokerFlags::default(),
            pool: PoolConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            discovery: DiscoveryConfig::default(),
            connect_timeout_ms: 2000,
            call_timeout_ms: None,
        }
    }
}

impl BrokerConfig {
    /// Broker without listener, parent or heartbeat.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port: 0,
            flags: BrokerFlags {
                noserver: true,
                ..BrokerFlags::default()
            },
            heartbeat: HeartbeatConfig {
                enabled: false,
                ..HeartbeatConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| BrokerError::Config(format!("invalid broker config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BrokerError::Config("broker name is empty".to_string()));
        }
        self.bind_addr()?;
        self.parent_addr()?;
        if self.heartbeat.enabled && (self.heartbeat.interval_ms == 0 || self.heartbeat.max_retries == 0) {
            return Err(BrokerError::Config(
                "heartbeat interval and max_retries must be positive".to_string(),
            ));
        }
        if !self.flags.light {
            self.pool.validate()?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|e| BrokerError::Config(format!("invalid bind address {}:{}: {}", self.ip, self.port, e)))
    }

    pub fn parent_addr(&self) -> Result<Option<SocketAddr>> {
        self.parent
            .as_deref()
            .map(|p| {
                p.parse()
                    .map_err(|e| BrokerError::Config(format!("invalid parent address {}: {}", p, e)))
            })
            .transpose()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_mask() {
        let flags = BrokerFlags::from_mask(5);
        assert!(flags.keepalive);
        assert!(!flags.light);
        assert!(flags.noserver);
        assert_eq!(flags.mask(), 5);
        assert_eq!(BrokerFlags::from_mask(0), BrokerFlags::default());
    }

    #[test]
    fn test_json_partial() {
        let config = BrokerConfig::from_json_str(
            r#"{ "name": "child", "port": 0, "parent": "127.0.0.1:9559",
                 "flags": { "keepalive": true }, "heartbeat": { "max_retries": 3 } }"#,
        )
        .unwrap();
        assert_eq!(config.name, "child");
        assert!(config.flags.keepalive);
        assert_eq!(config.heartbeat.max_retries, 3);
        assert_eq!(config.heartbeat.interval_ms, 5000);
        assert_eq!(config.parent_addr().unwrap().unwrap().port(), 9559);
    }

    #[test]
    fn test_invalid_config() {
        assert!(BrokerConfig::from_json_str(r#"{ "ip": "not an ip" }"#).is_err());
        assert!(BrokerConfig::from_json_str(r#"{ "parent": "nowhere" }"#).is_err());
        assert!(BrokerConfig::from_json_str(r#"{ "name": "" }"#).is_err());
        assert!(BrokerConfig::from_json_str("{").is_err());
    }
}
