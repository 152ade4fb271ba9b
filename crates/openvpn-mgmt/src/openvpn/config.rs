//! Client configuration: process launch, management address, retry and
//! timeout policy.

use crate::openvpn::management::ConnectionSettings;
use crate::openvpn::types::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Management address
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the OpenVPN process listens for management connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagementAddr {
    /// Loopback TCP. Port `0` picks a free port at start.
    Tcp { host: String, port: u16 },
    /// Unix domain socket path.
    Unix { path: PathBuf },
}

impl Default for ManagementAddr {
    fn default() -> Self {
        Self::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

impl fmt::Display for ManagementAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

impl ManagementAddr {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// `--management` arguments for the OpenVPN command line.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::Tcp { host, port } => {
                vec!["--management".into(), host.clone(), port.to_string()]
            }
            Self::Unix { path } => vec![
                "--management".into(),
                path.display().to_string(),
                "unix".into(),
            ],
        }
    }

    /// Replace a `0` TCP port with a free loopback port.
    pub fn resolve(&self) -> Result<Self, MgmtError> {
        match self {
            Self::Tcp { host, port: 0 } => Ok(Self::Tcp {
                host: host.clone(),
                port: crate::openvpn::process::find_free_mgmt_port()?,
            }),
            other => Ok(other.clone()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Dial retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded retry while the process brings up its management listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialRetry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Exponential back-off factor.
    pub backoff_factor: f64,
}

impl Default for DialRetry {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            base_delay_ms: 50,
            max_delay_ms: 500,
            backoff_factor: 1.5,
        }
    }
}

impl DialRetry {
    /// Delay before the given retry (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_delay_ms as f64) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// OpenVPN executable.
    pub binary: PathBuf,
    /// Arguments passed before the management options.
    pub args: Vec<String>,
    pub management: ManagementAddr,
    /// Adds `--management-query-passwords`.
    pub query_passwords: bool,
    pub dial_retry: DialRetry,
    /// `None` disables the command timeout.
    pub command_timeout_ms: Option<u64>,
    /// Grace period for the peer to close and the process to exit on stop.
    pub stop_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            args: Vec::new(),
            management: ManagementAddr::default(),
            query_passwords: false,
            dial_retry: DialRetry::default(),
            command_timeout_ms: Some(30_000),
            stop_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_management(mut self, addr: ManagementAddr) -> Self {
        self.management = addr;
        self
    }

    /// Parse a (possibly partial) JSON document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, MgmtError> {
        serde_json::from_str(json)
            .map_err(|e| MgmtError::parse("invalid client config").with_detail(e.to_string()))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            command_timeout: self.command_timeout(),
        }
    }
}
