use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use rdma::ibv::{ConnParam, QpCapability};

pub const DEFAULT_PORT: u16 = 20886;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub cq_capacity: i32,
    pub max_wr: u32,
    pub max_sge: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            cq_capacity: 16,
            max_wr: 8,
            max_sge: 2,
        }
    }
}

impl TransportConfig {
    pub fn qp_capability(&self) -> QpCapability {
        QpCapability {
            max_send_wr: self.max_wr,
            max_recv_wr: self.max_wr,
            max_send_sge: self.max_sge,
            max_recv_sge: self.max_sge,
            max_inline_data: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub resolve_timeout_ms: i32,
    pub listen_backlog: i32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            initiator_depth: 3,
            responder_resources: 3,
            retry_count: 3,
            resolve_timeout_ms: 2000,
            listen_backlog: 8,
        }
    }
}

impl ConnectionConfig {
    pub fn conn_param(&self) -> ConnParam {
        ConnParam {
            responder_resources: self.responder_resources,
            initiator_depth: self.initiator_depth,
            retry_count: self.retry_count,
            rnr_retry_count: 0,
        }
    }
}

/// Bounds on the blocking waits. An absent value waits forever.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub cm_event_ms: Option<u64>,
    pub completion_ms: Option<u64>,
    pub disconnect_ms: Option<u64>,
}

fn deadline_after(ms: Option<u64>) -> Option<Instant> {
    ms.map(|ms| Instant::now() + Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn cm_event(&self) -> Option<Instant> {
        deadline_after(self.cm_event_ms)
    }

    pub fn completion(&self) -> Option<Instant> {
        deadline_after(self.completion_ms)
    }

    pub fn disconnect(&self) -> Option<Instant> {
        deadline_after(self.disconnect_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub port: u16,
    pub transport: TransportConfig,
    pub connection: ConnectionConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: String::from("info"),
            port: DEFAULT_PORT,
            transport: TransportConfig::default(),
            connection: ConnectionConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Config::default()),
        }
    }
}
