//! Client-authentication event parsing.
//!
//! With `--management-client-auth` the server emits one `>CLIENT:` line per
//! event: `CONNECT,<cid>,<kid>`, `REAUTH,<cid>,<kid>`, `ESTABLISHED,<cid>`,
//! `DISCONNECT,<cid>`, `ADDRESS,<cid>,<addr>,<primary>` and a trailing block
//! of `ENV,<key>=<value>` lines closed by `ENV,END`. The functions here take
//! the text after the `>CLIENT:` prefix and never log or retry.

use crate::openvpn::types::MgmtError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Event types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientEventType {
    Connect,
    Reauth,
    Env,
    Established,
    Disconnect,
    Address,
}

impl ClientEventType {
    /// Map the wire name (`CONNECT`, `ENV`, …) to its event type.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "CONNECT" => Some(Self::Connect),
            "REAUTH" => Some(Self::Reauth),
            "ENV" => Some(Self::Env),
            "ESTABLISHED" => Some(Self::Established),
            "DISCONNECT" => Some(Self::Disconnect),
            "ADDRESS" => Some(Self::Address),
            _ => None,
        }
    }
}

impl fmt::Display for ClientEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Reauth => write!(f, "reauth"),
            Self::Env => write!(f, "env"),
            Self::Established => write!(f, "established"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::Address => write!(f, "address"),
        }
    }
}

/// One decoded `>CLIENT:` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub event_type: ClientEventType,
    pub raw_data: String,
}

impl ClientEvent {
    pub fn parse(line: &str) -> Result<Self, MgmtError> {
        let (event_type, raw_data) = parse_client_event(line)?;
        Ok(Self {
            event_type,
            raw_data: raw_data.to_string(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Parsers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split `<NAME>,<data>` into the event type and everything after the first
/// comma, unmodified.
pub fn parse_client_event(line: &str) -> Result<(ClientEventType, &str), MgmtError> {
    line.split_once(',')
        .and_then(|(name, data)| ClientEventType::from_wire(name).map(|t| (t, data)))
        .ok_or_else(|| MgmtError::parse(format!("unable to parse event: {}", line)))
}

/// Split an env payload at the first `=`. Without `=` the whole input is the
/// key and the value is empty.
pub fn parse_env_var(data: &str) -> (&str, &str) {
    data.split_once('=').unwrap_or((data, ""))
}

/// Parse `<cid>,<kid>`.
pub fn parse_id_and_key(data: &str) -> Result<(i64, i64), MgmtError> {
    let invalid = || MgmtError::parse(format!("unable to parse identifiers: {}", data));
    let (id, key) = data.split_once(',').ok_or_else(invalid)?;
    let id = id.parse().map_err(|_| invalid())?;
    let key = key.parse().map_err(|_| invalid())?;
    Ok((id, key))
}

/// Parse a single `<cid>`.
pub fn parse_id(data: &str) -> Result<i64, MgmtError> {
    data.parse()
        .map_err(|_| MgmtError::parse(format!("unable to parse identifier: {}", data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openvpn::types::MgmtErrorKind;

    #[test]
    fn client_event_is_parsed() {
        let cases = [
            ("CONNECT,1,1", ClientEventType::Connect, "1,1"),
            ("REAUTH,2,2", ClientEventType::Reauth, "2,2"),
            ("ENV,abc=123", ClientEventType::Env, "abc=123"),
            ("ESTABLISHED,1", ClientEventType::Established, "1"),
            ("DISCONNECT,1", ClientEventType::Disconnect, "1"),
            ("ADDRESS,123,ip1,ipsubnet", ClientEventType::Address, "123,ip1,ipsubnet"),
        ];
        for (line, event, data) in cases {
            let parsed = parse_client_event(line).unwrap();
            assert_eq!(parsed, (event, data), "{}", line);
        }
    }

    #[test]
    fn unparseable_event_fails() {
        let err = parse_client_event("UNPARSEABLE").unwrap_err();
        assert_eq!(err.kind, MgmtErrorKind::Parse);
        assert_eq!(err.to_string(), "unable to parse event: UNPARSEABLE");
    }

    #[test]
    fn unknown_event_name_fails_with_whole_line() {
        let err = parse_client_event("CR_RESPONSE,1,2,abc").unwrap_err();
        assert_eq!(err.to_string(), "unable to parse event: CR_RESPONSE,1,2,abc");
    }

    #[test]
    fn known_name_without_comma_fails() {
        let err = parse_client_event("CONNECT").unwrap_err();
        assert_eq!(err.to_string(), "unable to parse event: CONNECT");
    }

    #[test]
    fn owned_event_keeps_raw_data() {
        let event = ClientEvent::parse("ENV,common_name=client,1").unwrap();
        assert_eq!(event.event_type, ClientEventType::Env);
        assert_eq!(event.raw_data, "common_name=client,1");
    }

    #[test]
    fn event_type_serializes_lowercase() {
        let json = serde_json::to_string(&ClientEventType::Established).unwrap();
        assert_eq!(json, r#""established""#);
        assert_eq!(ClientEventType::Reauth.to_string(), "reauth");
    }

    // ── Env vars ────────────────────────────────────────────────

    #[test]
    fn env_var_is_parsed() {
        let cases = [
            ("abc=123", "abc", "123"),
            ("emptyval=", "emptyval", ""),
            ("noequal", "noequal", ""),
            ("equalsinvalue=abc=123", "equalsinvalue", "abc=123"),
        ];
        for (line, key, val) in cases {
            assert_eq!(parse_env_var(line), (key, val), "{}", line);
        }
    }

    // ── Identifiers ─────────────────────────────────────────────

    #[test]
    fn id_and_key_is_parsed() {
        assert_eq!(parse_id_and_key("123,456").unwrap(), (123, 456));
    }

    #[test]
    fn malformed_id_and_key_fails() {
        for line in ["abc,def", "garbage", "123,abc", "1,2,3", ""] {
            let err = parse_id_and_key(line).unwrap_err();
            assert_eq!(err.kind, MgmtErrorKind::Parse);
            assert_eq!(
                err.to_string(),
                format!("unable to parse identifiers: {}", line)
            );
        }
    }

    #[test]
    fn id_is_parsed() {
        assert_eq!(parse_id("123").unwrap(), 123);
        assert_eq!(parse_id("0").unwrap(), 0);
    }

    #[test]
    fn malformed_id_fails() {
        let err = parse_id("garbage").unwrap_err();
        assert_eq!(err.to_string(), "unable to parse identifier: garbage");
    }
}
