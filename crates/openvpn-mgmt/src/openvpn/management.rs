//! OpenVPN management interface connection.
//!
//! Owns the socket to a running OpenVPN process. A single read-loop task
//! splits every incoming line into real-time notifications (handed to the
//! middleware chain) and command-response fragments (handed to the one
//! command in flight).

use crate::openvpn::config::ManagementAddr;
use crate::openvpn::middleware::MiddlewareChain;
use crate::openvpn::protocol::{self, LineKind, LineReader, ResponseLine};
use crate::openvpn::types::*;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default time a caller waits for a command response.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// `None` waits forever.
    pub command_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Pending command
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Single,
    Multi,
}

/// Status line plus content lines. Single-line replies leave `lines` empty.
#[derive(Debug, Default)]
struct Reply {
    status: String,
    lines: Vec<String>,
}

type ReplySender = oneshot::Sender<Result<Reply, MgmtError>>;

struct PendingCommand {
    command: String,
    arity: Arity,
    started: bool,
    reply: Reply,
    /// `None` once the caller gave up waiting.
    tx: Option<ReplySender>,
}

impl PendingCommand {
    fn new(command: &str, arity: Arity, tx: ReplySender) -> Self {
        Self {
            command: command.to_string(),
            arity,
            started: false,
            reply: Reply::default(),
            tx: Some(tx),
        }
    }

    /// Feed one response fragment; returns the result once the response is
    /// complete.
    fn accept(&mut self, line: &str) -> Option<Result<Reply, MgmtError>> {
        let parsed = protocol::parse_response_line(line);
        match self.arity {
            Arity::Single => Some(match parsed {
                ResponseLine::Success(payload) => Ok(Reply {
                    status: payload.to_string(),
                    lines: Vec::new(),
                }),
                ResponseLine::Error(payload) => Err(MgmtError::command(payload)),
                _ => Err(MgmtError::protocol(format!(
                    "unknown command response: {}",
                    line
                ))),
            }),
            Arity::Multi if !self.started => {
                self.started = true;
                match parsed {
                    ResponseLine::Success(payload) => {
                        self.reply.status = payload.to_string();
                        None
                    }
                    ResponseLine::Error(payload) => Some(Err(MgmtError::command(payload))),
                    ResponseLine::End => Some(Ok(std::mem::take(&mut self.reply))),
                    ResponseLine::Other(content) => {
                        self.reply.lines.push(content.to_string());
                        None
                    }
                }
            }
            Arity::Multi => match parsed {
                ResponseLine::End => Some(Ok(std::mem::take(&mut self.reply))),
                _ => {
                    self.reply.lines.push(line.to_string());
                    None
                }
            },
        }
    }

    fn fulfill(self, result: Result<Reply, MgmtError>, conn_id: &str) {
        match self.tx {
            Some(tx) => {
                if tx.send(result).is_err() {
                    log::debug!(
                        "[mgmt:{}] caller of `{}` went away before the response",
                        conn_id,
                        protocol::command_verb(&self.command)
                    );
                }
            }
            None => log::info!(
                "[mgmt:{}] late response to abandoned `{}` consumed, connection back in sync",
                conn_id,
                protocol::command_verb(&self.command)
            ),
        }
    }
}

#[derive(Default)]
struct Inflight {
    pending: Option<PendingCommand>,
    closed: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Shared {
    id: String,
    peer: String,
    settings: ConnectionSettings,
    chain: MiddlewareChain,
    /// Send lock. `None` after teardown.
    writer: Mutex<Option<BoxedWriter>>,
    /// Taken by `start`.
    reader: Mutex<Option<BoxedReader>>,
    /// Serializes callers so at most one command is outstanding.
    command_lock: Mutex<()>,
    inflight: Mutex<Inflight>,
    last_error: Mutex<Option<MgmtError>>,
    chain_started: AtomicBool,
    chain_ready: watch::Sender<bool>,
    outcome: watch::Sender<Option<Result<(), MgmtError>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one management session. Clones share the same session.
#[derive(Clone)]
pub struct ManagementConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for ManagementConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementConnection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .finish()
    }
}

impl ManagementConnection {
    /// Dial the management interface.
    pub async fn connect(
        addr: &ManagementAddr,
        chain: MiddlewareChain,
        settings: ConnectionSettings,
    ) -> Result<Self, MgmtError> {
        let dial_error = |e: std::io::Error| {
            MgmtError::connection(format!(
                "cannot connect to management interface at {}",
                addr
            ))
            .with_detail(e.to_string())
        };

        match addr {
            ManagementAddr::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(dial_error)?;
                Ok(Self::from_stream(stream, addr.to_string(), chain, settings))
            }
            #[cfg(unix)]
            ManagementAddr::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(dial_error)?;
                Ok(Self::from_stream(stream, addr.to_string(), chain, settings))
            }
            #[cfg(not(unix))]
            ManagementAddr::Unix { .. } => Err(MgmtError::connection(format!(
                "unix management sockets are not supported on this platform: {}",
                addr
            ))),
        }
    }

    /// Wrap an already-open duplex stream. Nothing is read until `start`.
    pub fn from_stream<S>(
        stream: S,
        peer: impl Into<String>,
        chain: MiddlewareChain,
        settings: ConnectionSettings,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let peer = peer.into();
        log::info!("[mgmt:{}] connected to {}", id, peer);

        Self {
            shared: Arc::new(Shared {
                id,
                peer,
                settings,
                chain,
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
                command_lock: Mutex::new(()),
                inflight: Mutex::new(Inflight::default()),
                last_error: Mutex::new(None),
                chain_started: AtomicBool::new(false),
                chain_ready: watch::channel(false).0,
                outcome: watch::channel(None).0,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Spawn the read loop, then start the middleware chain.
    ///
    /// Real-time lines received while the chain is starting are held back
    /// and delivered in order once it has started. Command responses flow
    /// immediately, so middlewares may issue commands from `start`.
    pub async fn start(&self) -> Result<(), MgmtError> {
        let reader = self
            .shared
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| MgmtError::state("management connection already started"))?;

        let ready = self.shared.chain_ready.subscribe();
        let handle = tokio::spawn(read_loop(self.shared.clone(), reader, ready));
        *self.shared.task.lock().await = Some(handle);
        log::debug!("[mgmt:{}] read loop started", self.shared.id);

        self.shared.chain.start(self).await?;
        self.shared.chain_started.store(true, Ordering::SeqCst);
        self.shared.chain_ready.send_replace(true);
        Ok(())
    }

    /// Send a command answered by a single `SUCCESS:` / `ERROR:` line.
    pub async fn single_line_command(&self, command: &str) -> Result<String, MgmtError> {
        let reply = self.execute(command, Arity::Single).await?;
        Ok(reply.status)
    }

    /// Send a command answered by an optional status line, content lines and
    /// `END`. Returns the status (empty when absent) and the content lines.
    pub async fn multi_line_command(
        &self,
        command: &str,
    ) -> Result<(String, Vec<String>), MgmtError> {
        let reply = self.execute(command, Arity::Multi).await?;
        Ok((reply.status, reply.lines))
    }

    async fn execute(&self, command: &str, arity: Arity) -> Result<Reply, MgmtError> {
        let shared = &self.shared;
        let verb = protocol::command_verb(command);
        let _turn = shared.command_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut inflight = shared.inflight.lock().await;
            if inflight.closed {
                return Err(MgmtError::connection("management connection is closed"));
            }
            if let Some(stale) = &inflight.pending {
                return Err(MgmtError::connection(format!(
                    "connection desynchronized: still awaiting response to `{}`",
                    protocol::command_verb(&stale.command)
                )));
            }
            inflight.pending = Some(PendingCommand::new(command, arity, tx));
        }

        log::debug!("[mgmt:{}] > {}", shared.id, verb);
        if let Err(e) = shared.write_line(command).await {
            shared.inflight.lock().await.pending = None;
            return Err(e);
        }

        let received = match shared.settings.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    if let Some(pending) = shared.inflight.lock().await.pending.as_mut() {
                        pending.tx = None;
                    }
                    log::warn!(
                        "[mgmt:{}] no response to `{}` after {:?}",
                        shared.id,
                        verb,
                        limit
                    );
                    return Err(MgmtError::connection(format!(
                        "timed out waiting for response to {}",
                        verb
                    )));
                }
            },
            None => rx.await,
        };

        received.map_err(|_| MgmtError::connection("management connection closed"))?
    }

    /// Ask the read loop to stop and wait for teardown. Idempotent.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let handle = self.shared.task.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    log::error!("[mgmt:{}] read loop aborted: {}", self.shared.id, e);
                }
            }
            None => {
                let never_started = self.shared.reader.lock().await.take().is_some();
                if never_started {
                    self.shared.teardown(Ok(())).await;
                } else {
                    // Another caller owns the teardown.
                    let _ = self.wait().await;
                }
            }
        }
    }

    /// Resolves with the terminal outcome once the read loop has ended.
    pub async fn wait(&self) -> Result<(), MgmtError> {
        let mut outcome = self.shared.outcome.subscribe();
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MgmtError::connection("management connection dropped"))?;
        finished.clone().unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// Last non-fatal error seen by the read loop.
    pub async fn last_error(&self) -> Option<MgmtError> {
        self.shared.last_error.lock().await.clone()
    }
}

impl Shared {
    async fn write_line(&self, line: &str) -> Result<(), MgmtError> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| MgmtError::connection("management connection is closed"))?;
        let write_error = |e: std::io::Error| {
            MgmtError::connection("failed to send command").with_detail(e.to_string())
        };
        writer.write_all(line.as_bytes()).await.map_err(write_error)?;
        writer.write_all(b"\n").await.map_err(write_error)?;
        writer.flush().await.map_err(write_error)
    }

    async fn record_error(&self, error: MgmtError) {
        *self.last_error.lock().await = Some(error);
    }

    async fn dispatch_async(&self, line: &str) {
        match self.chain.consume_line(line) {
            Ok(true) => {}
            Ok(false) => log::trace!("[mgmt:{}] unclaimed: {}", self.id, line),
            Err(e) => {
                log::warn!("[mgmt:{}] middleware failed on `{}`: {}", self.id, line, e);
                self.record_error(e).await;
            }
        }
    }

    async fn dispatch_response(&self, line: &str) {
        let mut inflight = self.inflight.lock().await;
        if let Some(pending) = inflight.pending.as_mut() {
            if let Some(result) = pending.accept(line) {
                if let Some(done) = inflight.pending.take() {
                    done.fulfill(result, &self.id);
                }
            }
            return;
        }
        drop(inflight);

        let e = MgmtError::protocol(format!("unexpected line with no command pending: {}", line));
        log::warn!("[mgmt:{}] {}", self.id, e);
        self.record_error(e).await;
    }

    /// Runs exactly once, on the read loop exit path (or from `close` when
    /// the loop never started).
    async fn teardown(self: &Arc<Self>, outcome: Result<(), MgmtError>) {
        {
            let mut inflight = self.inflight.lock().await;
            inflight.closed = true;
            if let Some(pending) = inflight.pending.take() {
                pending.fulfill(
                    Err(MgmtError::connection("management connection closed")),
                    &self.id,
                );
            }
        }

        if self.chain_started.load(Ordering::SeqCst) {
            let conn = ManagementConnection {
                shared: self.clone(),
            };
            self.chain.stop(&conn).await;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                log::debug!("[mgmt:{}] shutdown: {}", self.id, e);
            }
        }

        match &outcome {
            Ok(()) => log::info!("[mgmt:{}] connection to {} closed", self.id, self.peer),
            Err(e) => log::error!("[mgmt:{}] connection to {} lost: {}", self.id, self.peer, e),
        }
        self.outcome.send_replace(Some(outcome));
    }
}

async fn read_loop(shared: Arc<Shared>, reader: BoxedReader, mut ready: watch::Receiver<bool>) {
    let mut lines = LineReader::new(reader);
    let mut chain_ready = *ready.borrow_and_update();
    let mut held_back: VecDeque<String> = VecDeque::new();

    let outcome = loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break Ok(()),

            // The sender lives in `shared`, so `changed` only fails once the
            // loop itself is gone.
            changed = ready.changed(), if !chain_ready => {
                if changed.is_ok() && *ready.borrow_and_update() {
                    chain_ready = true;
                    while let Some(line) = held_back.pop_front() {
                        shared.dispatch_async(&line).await;
                    }
                }
            }

            next = lines.next_line() => match next {
                Ok(Some(line)) => {
                    log::trace!("[mgmt:{}] < {}", shared.id, line);
                    match protocol::classify_line(&line) {
                        LineKind::Async if chain_ready => shared.dispatch_async(&line).await,
                        LineKind::Async => held_back.push_back(line),
                        LineKind::Response => shared.dispatch_response(&line).await,
                    }
                }
                Ok(None) => break Ok(()),
                // Only transport failures end up here; undecodable bytes are
                // replaced during framing.
                Err(e) => {
                    break Err(MgmtError::connection("management connection read failed")
                        .with_detail(e.to_string()))
                }
            },
        }
    };

    shared.teardown(outcome).await;
}
