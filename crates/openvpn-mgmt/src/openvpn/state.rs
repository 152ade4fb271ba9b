//! Connection state tracking from `>STATE:` and `>BYTECOUNT:` notifications.

use crate::openvpn::management::ManagementConnection;
use crate::openvpn::middleware::Middleware;
use crate::openvpn::protocol::{self, MgmtCommands};
use crate::openvpn::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Map a management STATE name to the coarse status.
pub fn state_name_to_state(state_name: &str) -> State {
    match state_name.to_uppercase().as_str() {
        "CONNECTED" => State::Connected,
        "RECONNECTING" => State::Reconnecting,
        "EXITING" => State::Disconnecting,
        // CONNECTING, WAIT, AUTH, GET_CONFIG, ASSIGN_IP, ADD_ROUTES, RESOLVE, TCP_CONNECT
        _ => State::Connecting,
    }
}

/// Latest known tunnel state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub state: State,
    /// Raw OpenVPN state name (`CONNECTED`, `WAIT`, …).
    pub openvpn_state: Option<String>,
    pub description: Option<String>,
    pub local_ip: Option<String>,
    pub remote_ip: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: State::NotConnected,
            openvpn_state: None,
            description: None,
            local_ip: None,
            remote_ip: None,
            bytes_in: 0,
            bytes_out: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Middleware turning real-time state notifications into a `StateSnapshot`.
pub struct StateTracker {
    bytecount_interval: Option<u32>,
    snapshot: watch::Sender<StateSnapshot>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            bytecount_interval: None,
            snapshot: watch::channel(StateSnapshot::default()).0,
        }
    }

    /// Also request `>BYTECOUNT:` every `secs` seconds.
    pub fn with_bytecount(mut self, secs: u32) -> Self {
        self.bytecount_interval = Some(secs);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::new(self.snapshot.borrow().state)
    }

    fn update(&self, apply: impl FnOnce(&mut StateSnapshot)) {
        self.snapshot.send_modify(|snapshot| {
            apply(snapshot);
            snapshot.updated_at = Utc::now();
        });
    }
}

#[async_trait]
impl Middleware for StateTracker {
    async fn start(&self, connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.update(|s| s.state = State::Connecting);
        connection.single_line_command(MgmtCommands::STATE_ON).await?;
        if let Some(secs) = self.bytecount_interval {
            connection
                .single_line_command(&MgmtCommands::bytecount(secs))
                .await?;
        }
        Ok(())
    }

    async fn stop(&self, _connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.update(|s| {
            s.state = State::NotConnected;
            s.openvpn_state = None;
            s.description = None;
        });
        Ok(())
    }

    fn consume_line(&self, line: &str) -> Result<bool, MgmtError> {
        match protocol::parse_mgmt_line(line) {
            Some(MgmtMessage::State(st)) => {
                let state = state_name_to_state(&st.state_name);
                log::debug!("[state] {} -> {}", st.state_name, state);
                self.update(|s| {
                    s.state = state;
                    s.openvpn_state = Some(st.state_name);
                    s.description = Some(st.description).filter(|d| !d.is_empty());
                    if st.local_ip.is_some() {
                        s.local_ip = st.local_ip;
                    }
                    if st.remote_ip.is_some() {
                        s.remote_ip = st.remote_ip;
                    }
                });
                Ok(true)
            }
            Some(MgmtMessage::ByteCount { rx, tx }) => {
                self.update(|s| {
                    s.bytes_in = rx;
                    s.bytes_out = tx;
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
