//! Wire-level helpers for the OpenVPN management protocol.
//!
//! The protocol is newline-terminated text. Lines starting with `>` are
//! real-time notifications; everything else belongs to the response of the
//! command currently in flight (`SUCCESS:` / `ERROR:` for single-line
//! commands, an optional status line followed by content lines and `END` for
//! multi-line commands).

use crate::openvpn::types::*;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// First byte of every real-time notification.
pub const ASYNC_PREFIX: char = '>';
/// Prefix of a successful single-line response.
pub const SUCCESS_PREFIX: &str = "SUCCESS:";
/// Prefix of a failed response.
pub const ERROR_PREFIX: &str = "ERROR:";
/// Terminator of a multi-line response block.
pub const END_MARKER: &str = "END";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a raw line read from the socket must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Real-time notification, routed to the middleware chain.
    Async,
    /// Fragment of a command response, routed to the pending command.
    Response,
}

/// Classify a line with its terminator already stripped.
pub fn classify_line(line: &str) -> LineKind {
    if line.starts_with(ASYNC_PREFIX) {
        LineKind::Async
    } else {
        LineKind::Response
    }
}

/// Decoded response fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLine<'a> {
    Success(&'a str),
    Error(&'a str),
    End,
    Other(&'a str),
}

/// Decode a response fragment. The payload after `SUCCESS:` / `ERROR:` loses
/// the single separating space, nothing else.
pub fn parse_response_line(line: &str) -> ResponseLine<'_> {
    if let Some(rest) = line.strip_prefix(SUCCESS_PREFIX) {
        ResponseLine::Success(rest.strip_prefix(' ').unwrap_or(rest))
    } else if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        ResponseLine::Error(rest.strip_prefix(' ').unwrap_or(rest))
    } else if line == END_MARKER {
        ResponseLine::End
    } else {
        ResponseLine::Other(line)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Real-time message decoder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode a real-time line (`>TYPE:payload`) into a typed `MgmtMessage`.
///
/// Returns `None` for lines that are not real-time notifications.
pub fn parse_mgmt_line(line: &str) -> Option<MgmtMessage> {
    let rest = line.strip_prefix(ASYNC_PREFIX)?;
    Some(parse_realtime_message(rest))
}

fn parse_realtime_message(rest: &str) -> MgmtMessage {
    let Some((msg_type, payload)) = rest.split_once(':') else {
        return MgmtMessage::Unknown(rest.to_string());
    };

    match msg_type {
        "INFO" => MgmtMessage::Info(payload.to_string()),

        // timestamp,state,description,tun_ip,remote_ip,remote_port,local_addr,local_port,tun_ip6
        "STATE" => {
            let fields: Vec<&str> = payload.split(',').collect();
            if fields.len() < 2 {
                return MgmtMessage::Unknown(rest.to_string());
            }
            MgmtMessage::State(MgmtState {
                timestamp: fields[0].parse().unwrap_or(0),
                state_name: fields[1].to_string(),
                description: fields.get(2).unwrap_or(&"").to_string(),
                local_ip: non_empty(fields.get(3)),
                remote_ip: non_empty(fields.get(4)),
                remote_port: fields.get(5).and_then(|s| s.parse().ok()),
                local_port: fields.get(7).and_then(|s| s.parse().ok()),
            })
        }

        "BYTECOUNT" => match payload.split_once(',') {
            Some((rx, tx)) => MgmtMessage::ByteCount {
                rx: rx.parse().unwrap_or(0),
                tx: tx.parse().unwrap_or(0),
            },
            None => MgmtMessage::Unknown(rest.to_string()),
        },

        "BYTECOUNT_CLI" => {
            let parts: Vec<&str> = payload.split(',').collect();
            match parts.as_slice() {
                [cid, rx, tx] => match cid.parse() {
                    Ok(client_id) => MgmtMessage::ByteCountClient {
                        client_id,
                        rx: rx.parse().unwrap_or(0),
                        tx: tx.parse().unwrap_or(0),
                    },
                    Err(_) => MgmtMessage::Unknown(rest.to_string()),
                },
                _ => MgmtMessage::Unknown(rest.to_string()),
            }
        }

        "HOLD" => MgmtMessage::Hold(payload.to_string()),

        "PASSWORD" => MgmtMessage::PasswordNeeded(payload.to_string()),

        "LOG" => {
            let parts: Vec<&str> = payload.splitn(3, ',').collect();
            if let [ts, flags, message] = parts.as_slice() {
                MgmtMessage::Log(MgmtLogEntry {
                    timestamp: ts.parse().unwrap_or(0),
                    flags: flags.to_string(),
                    message: message.to_string(),
                })
            } else {
                MgmtMessage::Log(MgmtLogEntry {
                    timestamp: 0,
                    flags: String::new(),
                    message: payload.to_string(),
                })
            }
        }

        "CLIENT" => MgmtMessage::Client(payload.to_string()),

        "FATAL" => MgmtMessage::Fatal(payload.to_string()),

        "REMOTE" => {
            let parts: Vec<&str> = payload.split(',').collect();
            if parts.len() >= 3 {
                MgmtMessage::Remote {
                    host: parts[0].to_string(),
                    port: parts[1].parse().unwrap_or(0),
                    proto: parts[2].to_string(),
                }
            } else {
                MgmtMessage::Unknown(rest.to_string())
            }
        }

        "NEED-OK" => MgmtMessage::NeedOk(payload.to_string()),

        "ECHO" => MgmtMessage::Echo(payload.to_string()),

        _ => MgmtMessage::Unknown(rest.to_string()),
    }
}

fn non_empty(field: Option<&&str>) -> Option<String> {
    field.filter(|s| !s.is_empty()).map(|s| s.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Command builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Quote an argument the way the management interface tokenizer expects:
/// wrapped in double quotes with `\` and `"` backslash-escaped.
pub fn quote_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Well-known management commands.
pub struct MgmtCommands;

impl MgmtCommands {
    pub const HOLD_RELEASE: &'static str = "hold release";
    pub const STATE: &'static str = "state";
    pub const STATE_ON: &'static str = "state on";
    pub const STATUS: &'static str = "status 2";
    pub const LOG_ON: &'static str = "log on all";
    pub const PID: &'static str = "pid";
    pub const VERSION: &'static str = "version";

    pub fn bytecount(interval: u32) -> String {
        format!("bytecount {}", interval)
    }

    pub fn signal(name: &str) -> String {
        format!("signal {}", name)
    }

    pub fn username(auth_type: &str, user: &str) -> String {
        format!("username {} {}", quote_arg(auth_type), quote_arg(user))
    }

    pub fn password(auth_type: &str, pass: &str) -> String {
        format!("password {} {}", quote_arg(auth_type), quote_arg(pass))
    }

    pub fn client_auth_nt(client_id: i64, key_id: i64) -> String {
        format!("client-auth-nt {} {}", client_id, key_id)
    }

    pub fn client_deny(client_id: i64, key_id: i64, reason: &str) -> String {
        format!("client-deny {} {} {}", client_id, key_id, quote_arg(reason))
    }

    pub fn client_kill(client_id: i64) -> String {
        format!("client-kill {}", client_id)
    }
}

/// First word of a command, safe to log when the rest may carry secrets.
pub fn command_verb(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Line framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Longest line kept in full; the remainder up to the newline is dropped.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Splits a byte stream into lines without trusting its encoding.
///
/// Lines are decoded lossily, so invalid UTF-8 in log text or client env
/// values never ends the stream. `next_line` is cancel safe: a partial line
/// stays buffered until the next call.
pub(crate) struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    truncated: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            truncated: false,
        }
    }

    /// Next line with `\n` / `\r\n` stripped; `None` at end of stream.
    /// A trailing line without a terminator is still returned.
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() && !self.truncated {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let end = newline.unwrap_or(available.len());
            let room = MAX_LINE_LEN.saturating_sub(self.buf.len());
            if end > room {
                self.truncated = true;
            }
            self.buf.extend_from_slice(&available[..end.min(room)]);
            let used = newline.map_or(end, |i| i + 1);
            self.inner.consume(used);

            if newline.is_some() {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if std::mem::take(&mut self.truncated) {
            log::warn!("line longer than {} bytes truncated", MAX_LINE_LEN);
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
