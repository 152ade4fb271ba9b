//! Server-side client authentication (`--management-client-auth`).
//!
//! Assembles `>CLIENT:` lines into complete session events, forwards them to
//! an external session tracker and answers `CONNECT` / `REAUTH` requests.

use crate::openvpn::auth::{self, ClientEventType};
use crate::openvpn::management::ManagementConnection;
use crate::openvpn::middleware::Middleware;
use crate::openvpn::protocol::{self, MgmtCommands};
use crate::openvpn::types::*;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientSessionKind {
    Connect,
    Reauth,
    Established,
    Disconnect,
    Address,
}

/// A fully assembled `>CLIENT:` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSessionEvent {
    pub kind: ClientSessionKind,
    pub client_id: i64,
    /// Present for `CONNECT` / `REAUTH`.
    pub key_id: Option<i64>,
    /// Present for `ADDRESS`: everything after the client id.
    pub address: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ClientSessionEvent {
    fn new(kind: ClientSessionKind, client_id: i64, key_id: Option<i64>) -> Self {
        Self {
            kind,
            client_id,
            key_id,
            address: None,
            env: BTreeMap::new(),
        }
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn username(&self) -> Option<&str> {
        self.env_var("username")
    }

    pub fn password(&self) -> Option<&str> {
        self.env_var("password")
    }

    pub fn common_name(&self) -> Option<&str> {
        self.env_var("common_name")
    }
}

/// Feeds `>CLIENT:` payloads one at a time and yields completed events.
#[derive(Debug, Default)]
pub struct ClientEventAssembler {
    current: Option<ClientSessionEvent>,
}

impl ClientEventAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `payload` is the text after `>CLIENT:`.
    pub fn feed(&mut self, payload: &str) -> Result<Option<ClientSessionEvent>, MgmtError> {
        let (event_type, data) = auth::parse_client_event(payload)?;
        match event_type {
            ClientEventType::Connect | ClientEventType::Reauth => {
                let (cid, kid) = auth::parse_id_and_key(data)?;
                let kind = if event_type == ClientEventType::Connect {
                    ClientSessionKind::Connect
                } else {
                    ClientSessionKind::Reauth
                };
                self.open(ClientSessionEvent::new(kind, cid, Some(kid)));
                Ok(None)
            }
            ClientEventType::Established | ClientEventType::Disconnect => {
                let cid = auth::parse_id(data)?;
                let kind = if event_type == ClientEventType::Established {
                    ClientSessionKind::Established
                } else {
                    ClientSessionKind::Disconnect
                };
                self.open(ClientSessionEvent::new(kind, cid, None));
                Ok(None)
            }
            ClientEventType::Address => {
                let (cid, rest) = data.split_once(',').unwrap_or((data, ""));
                let mut event =
                    ClientSessionEvent::new(ClientSessionKind::Address, auth::parse_id(cid)?, None);
                event.address = Some(rest.to_string());
                Ok(Some(event))
            }
            ClientEventType::Env => {
                if data == "END" {
                    return self
                        .current
                        .take()
                        .map(Some)
                        .ok_or_else(|| MgmtError::parse("ENV,END without an open client event"));
                }
                let current = self.current.as_mut().ok_or_else(|| {
                    MgmtError::parse(format!("env line without an open client event: {}", data))
                })?;
                let (key, value) = auth::parse_env_var(data);
                current.env.insert(key.to_string(), value.to_string());
                Ok(None)
            }
        }
    }

    fn open(&mut self, event: ClientSessionEvent) {
        if let Some(unfinished) = self.current.replace(event) {
            log::warn!(
                "[client-auth] dropping unterminated {:?} block for client {}",
                unfinished.kind,
                unfinished.client_id
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Middleware
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny { reason: String },
}

/// Decides whether a connecting client may proceed.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, event: &ClientSessionEvent) -> Result<AuthDecision, MgmtError>;
}

pub struct ClientAuthMiddleware {
    validator: Arc<dyn CredentialValidator>,
    assembler: Mutex<ClientEventAssembler>,
    events: mpsc::UnboundedSender<ClientSessionEvent>,
    connection: Mutex<Option<ManagementConnection>>,
}

impl ClientAuthMiddleware {
    /// Returns the middleware and the receiving end of its session events.
    pub fn new(
        validator: Arc<dyn CredentialValidator>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientSessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let middleware = Self {
            validator,
            assembler: Mutex::new(ClientEventAssembler::new()),
            events,
            connection: Mutex::new(None),
        };
        (middleware, rx)
    }

    fn connection(&self) -> Option<ManagementConnection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_connection(&self, connection: Option<ManagementConnection>) {
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    fn authorize(&self, event: ClientSessionEvent) -> Result<(), MgmtError> {
        let Some(key_id) = event.key_id else {
            return Ok(());
        };
        let connection = self
            .connection()
            .ok_or_else(|| MgmtError::state("client event before middleware start"))?;
        let validator = self.validator.clone();

        tokio::spawn(async move {
            let decision = validator.validate(&event).await.unwrap_or_else(|e| {
                log::error!("[client-auth] validator failed for client {}: {}", event.client_id, e);
                AuthDecision::Deny {
                    reason: "internal error".into(),
                }
            });
            let command = match &decision {
                AuthDecision::Allow => MgmtCommands::client_auth_nt(event.client_id, key_id),
                AuthDecision::Deny { reason } => {
                    MgmtCommands::client_deny(event.client_id, key_id, reason)
                }
            };
            match connection.single_line_command(&command).await {
                Ok(_) => log::info!(
                    "[client-auth:{}] client {} {}",
                    connection.id(),
                    event.client_id,
                    if decision == AuthDecision::Allow { "allowed" } else { "denied" }
                ),
                Err(e) => log::error!(
                    "[client-auth:{}] reply for client {} failed: {}",
                    connection.id(),
                    event.client_id,
                    e
                ),
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Middleware for ClientAuthMiddleware {
    async fn start(&self, connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.set_connection(Some(connection.clone()));
        Ok(())
    }

    async fn stop(&self, _connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.set_connection(None);
        Ok(())
    }

    fn consume_line(&self, line: &str) -> Result<bool, MgmtError> {
        let Some(MgmtMessage::Client(payload)) = protocol::parse_mgmt_line(line) else {
            return Ok(false);
        };

        let completed = self
            .assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed(&payload)?;

        if let Some(event) = completed {
            if self.events.send(event.clone()).is_err() {
                log::debug!("[client-auth] session event receiver dropped");
            }
            if matches!(event.kind, ClientSessionKind::Connect | ClientSessionKind::Reauth) {
                self.authorize(event)?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openvpn::management::ConnectionSettings;
    use crate::openvpn::middleware::MiddlewareChain;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn feed_all(assembler: &mut ClientEventAssembler, lines: &[&str]) -> Vec<ClientSessionEvent> {
        lines
            .iter()
            .filter_map(|l| assembler.feed(l).unwrap())
            .collect()
    }

    #[test]
    fn connect_block_is_assembled() {
        let mut a = ClientEventAssembler::new();
        let events = feed_all(
            &mut a,
            &[
                "CONNECT,7,1",
                "ENV,username=alice",
                "ENV,password=p=w",
                "ENV,untrusted_ip=1.2.3.4",
                "ENV,END",
            ],
        );
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.kind, ClientSessionKind::Connect);
        assert_eq!((e.client_id, e.key_id), (7, Some(1)));
        assert_eq!(e.username(), Some("alice"));
        assert_eq!(e.password(), Some("p=w"));
        assert_eq!(e.env_var("untrusted_ip"), Some("1.2.3.4"));
    }

    #[test]
    fn established_and_disconnect_have_no_key() {
        let mut a = ClientEventAssembler::new();
        let events = feed_all(
            &mut a,
            &["ESTABLISHED,3", "ENV,common_name=c1", "ENV,END", "DISCONNECT,3", "ENV,END"],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ClientSessionKind::Established);
        assert_eq!(events[0].key_id, None);
        assert_eq!(events[0].common_name(), Some("c1"));
        assert_eq!(events[1].kind, ClientSessionKind::Disconnect);
        assert!(events[1].env.is_empty());
    }

    #[test]
    fn address_is_single_line() {
        let mut a = ClientEventAssembler::new();
        let event = a.feed("ADDRESS,123,ip1,ipsubnet").unwrap().unwrap();
        assert_eq!(event.kind, ClientSessionKind::Address);
        assert_eq!(event.client_id, 123);
        assert_eq!(event.address.as_deref(), Some("ip1,ipsubnet"));
    }

    #[test]
    fn malformed_lines_are_parse_errors() {
        let mut a = ClientEventAssembler::new();
        assert_eq!(
            a.feed("CONNECT,abc,def").unwrap_err().to_string(),
            "unable to parse identifiers: abc,def"
        );
        assert_eq!(
            a.feed("DISCONNECT,garbage").unwrap_err().to_string(),
            "unable to parse identifier: garbage"
        );
        assert_eq!(
            a.feed("UNPARSEABLE").unwrap_err().to_string(),
            "unable to parse event: UNPARSEABLE"
        );
        assert_eq!(a.feed("ENV,x=1").unwrap_err().kind, MgmtErrorKind::Parse);
        assert_eq!(a.feed("ENV,END").unwrap_err().kind, MgmtErrorKind::Parse);
    }

    #[test]
    fn new_header_replaces_open_block() {
        let mut a = ClientEventAssembler::new();
        let events = feed_all(&mut a, &["CONNECT,1,0", "ENV,a=1", "REAUTH,2,5", "ENV,END"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ClientSessionKind::Reauth);
        assert_eq!(events[0].client_id, 2);
        assert!(events[0].env.is_empty());
    }

    struct PasswordIs(&'static str);

    #[async_trait]
    impl CredentialValidator for PasswordIs {
        async fn validate(&self, event: &ClientSessionEvent) -> Result<AuthDecision, MgmtError> {
            if event.password() == Some(self.0) {
                Ok(AuthDecision::Allow)
            } else {
                Ok(AuthDecision::Deny {
                    reason: "bad credentials".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn connect_is_answered_and_forwarded() {
        let (mw, mut events) = ClientAuthMiddleware::new(Arc::new(PasswordIs("good")));
        let (client, server) = tokio::io::duplex(4096);
        let conn = ManagementConnection::from_stream(
            client,
            "stub",
            MiddlewareChain::new().with(Arc::new(mw)),
            ConnectionSettings::default(),
        );
        conn.start().await.unwrap();

        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b">CLIENT:CONNECT,0,1\n>CLIENT:ENV,password=good\n>CLIENT:ENV,END\n")
            .await
            .unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "client-auth-nt 0 1");
        write
            .write_all(b"SUCCESS: client-auth command succeeded\n")
            .await
            .unwrap();

        write
            .write_all(b">CLIENT:CONNECT,1,1\n>CLIENT:ENV,password=bad\n>CLIENT:ENV,END\n")
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"client-deny 1 1 "bad credentials""#
        );
        write
            .write_all(b"SUCCESS: client-deny command succeeded\n")
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.client_id, 0);
        let second = events.recv().await.unwrap();
        assert_eq!(second.client_id, 1);

        conn.close().await;
    }
}
