//! Shared types, enums, error types, and real-time message payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection status read model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coarse tunnel state exposed to status consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// No process running, or the tunnel is down.
    NotConnected,
    /// Process launched and negotiating.
    Connecting,
    /// Tunnel is up and traffic is flowing.
    Connected,
    /// Graceful disconnect in progress.
    Disconnecting,
    /// Reconnecting after a failure.
    Reconnecting,
}

impl Default for State {
    fn default() -> Self {
        Self::NotConnected
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "NotConnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Status snapshot handed to the HTTP surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: State,
}

impl ConnectionStatus {
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle state of a [`Client`](crate::openvpn::client::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    /// Establishment failed. Terminal.
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Started => write!(f, "Started"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl ClientState {
    /// Project the lifecycle onto the coarse status read model.
    pub fn as_status(&self) -> ConnectionStatus {
        let state = match self {
            Self::Created | Self::Stopped | Self::Failed => State::NotConnected,
            Self::Starting => State::Connecting,
            Self::Started => State::Connected,
            Self::Stopping => State::Disconnecting,
        };
        ConnectionStatus::new(state)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Management interface types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parsed real-time message from the management interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MgmtMessage {
    /// >INFO: message
    Info(String),
    /// >STATE: fields…
    State(MgmtState),
    /// >BYTECOUNT: rx,tx
    ByteCount { rx: u64, tx: u64 },
    /// >BYTECOUNT_CLI: cid,rx,tx
    ByteCountClient { client_id: i64, rx: u64, tx: u64 },
    /// >HOLD: message
    Hold(String),
    /// >PASSWORD: Need 'Auth' username/password
    PasswordNeeded(String),
    /// >LOG: timestamp,flags,message
    Log(MgmtLogEntry),
    /// >CLIENT: EVENT,data
    Client(String),
    /// >FATAL: message
    Fatal(String),
    /// >REMOTE: host,port,proto
    Remote { host: String, port: u16, proto: String },
    /// >NEED-OK: message
    NeedOk(String),
    /// >ECHO: timestamp,message
    Echo(String),
    /// Any unrecognised real-time message.
    Unknown(String),
}

/// Parsed `>STATE:` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MgmtState {
    pub timestamp: u64,
    pub state_name: String,
    pub description: String,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub local_port: Option<u16>,
}

/// Parsed `>LOG:` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MgmtLogEntry {
    pub timestamp: u64,
    pub flags: String,
    pub message: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Crate-level error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MgmtErrorKind {
    /// Dial failure, socket closed, read/write failure, command timeout.
    Connection,
    /// A line that fits neither a pending command nor the real-time shape.
    Protocol,
    /// `ERROR:` response from the management interface.
    Command,
    /// Malformed client event, env or identifier payload.
    Parse,
    /// Invalid lifecycle transition.
    State,
    /// Process or connection establishment failed.
    Start,
    /// OpenVPN process could not be spawned or exited abnormally.
    Process,
}

/// Crate-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}{}", .detail.as_ref().map(|d| format!(" ({})", d)).unwrap_or_default())]
pub struct MgmtError {
    pub kind: MgmtErrorKind,
    pub message: String,
    pub detail: Option<String>,
    /// Underlying error, for wrappers such as [`MgmtError::start`].
    #[source]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<MgmtError>>,
}

impl MgmtError {
    pub fn new(kind: MgmtErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
            cause: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(MgmtErrorKind::Connection, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(MgmtErrorKind::Protocol, msg)
    }

    /// Wrap the payload of an `ERROR:` response verbatim.
    pub fn command(server_text: &str) -> Self {
        Self::new(
            MgmtErrorKind::Command,
            format!("command error: {}", server_text),
        )
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(MgmtErrorKind::Parse, msg)
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::new(MgmtErrorKind::State, msg)
    }

    /// Establishment failure. `cause` stays reachable through `source()`
    /// and its text is repeated in `detail`.
    pub fn start(cause: MgmtError) -> Self {
        let mut err = Self::new(MgmtErrorKind::Start, "failed to start openvpn client")
            .with_detail(cause.to_string());
        err.cause = Some(Box::new(cause));
        err
    }

    /// Kind of the innermost wrapped error, or this error's own kind.
    pub fn root_kind(&self) -> MgmtErrorKind {
        match &self.cause {
            Some(cause) => cause.root_kind(),
            None => self.kind,
        }
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::new(MgmtErrorKind::Process, msg)
    }

    pub fn is_kind(&self, kind: MgmtErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<std::io::Error> for MgmtError {
    fn from(e: std::io::Error) -> Self {
        Self::connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::new(State::NotConnected)).unwrap();
        assert_eq!(json, r#"{"state":"not_connected"}"#);
        let back: ConnectionStatus = serde_json::from_str(r#"{"state":"reconnecting"}"#).unwrap();
        assert_eq!(back.state, State::Reconnecting);
    }

    #[test]
    fn status_defaults_to_not_connected() {
        assert_eq!(ConnectionStatus::default().state, State::NotConnected);
    }

    #[test]
    fn client_state_projection() {
        assert_eq!(ClientState::Created.as_status().state, State::NotConnected);
        assert_eq!(ClientState::Starting.as_status().state, State::Connecting);
        assert_eq!(ClientState::Started.as_status().state, State::Connected);
        assert_eq!(ClientState::Stopping.as_status().state, State::Disconnecting);
        assert_eq!(ClientState::Stopped.as_status().state, State::NotConnected);
        assert_eq!(ClientState::Failed.as_status().state, State::NotConnected);
    }

    // ── MgmtError ───────────────────────────────────────────────

    #[test]
    fn command_error_keeps_server_text() {
        let e = MgmtError::command("Unknown command BAD_COMMAND");
        assert_eq!(e.kind, MgmtErrorKind::Command);
        assert_eq!(e.to_string(), "command error: Unknown command BAD_COMMAND");
    }

    #[test]
    fn detail_is_appended_to_display() {
        let e = MgmtError::connection("cannot connect").with_detail("refused");
        assert_eq!(e.to_string(), "cannot connect (refused)");
    }

    #[test]
    fn start_error_wraps_cause() {
        use std::error::Error as _;

        let cause = MgmtError::process("spawn failed");
        let e = MgmtError::start(cause.clone());
        assert!(e.is_kind(MgmtErrorKind::Start));
        assert_eq!(e.detail.as_deref(), Some("spawn failed"));
        assert_eq!(e.cause.as_deref(), Some(&cause));
        assert_eq!(e.root_kind(), MgmtErrorKind::Process);
        assert_eq!(e.source().map(|s| s.to_string()).as_deref(), Some("spawn failed"));
    }

    #[test]
    fn cause_is_omitted_from_json_when_absent() {
        let json = serde_json::to_value(MgmtError::state("nope")).unwrap();
        assert!(json.get("cause").is_none());

        let wrapped = MgmtError::start(MgmtError::connection("refused"));
        let back: MgmtError =
            serde_json::from_value(serde_json::to_value(&wrapped).unwrap()).unwrap();
        assert_eq!(back, wrapped);
    }

    #[test]
    fn io_error_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: MgmtError = io.into();
        assert_eq!(e.kind, MgmtErrorKind::Connection);
        assert!(e.message.contains("pipe broke"));
    }
}
