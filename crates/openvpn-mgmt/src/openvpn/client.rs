//! Client lifecycle: launch OpenVPN, attach to its management interface,
//! and tear both down again.

use crate::openvpn::config::{ClientConfig, ManagementAddr};
use crate::openvpn::management::ManagementConnection;
use crate::openvpn::middleware::MiddlewareChain;
use crate::openvpn::process::{self, ProcessExit, ProcessHandle};
use crate::openvpn::protocol::MgmtCommands;
use crate::openvpn::types::*;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

/// Upper bound on the `--version` check run before each launch.
const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives one OpenVPN process and its management connection through
/// `Created → Starting → Started → Stopping → Stopped` (or `Failed`).
pub struct Client {
    config: ClientConfig,
    chain: MiddlewareChain,
    state: watch::Sender<ClientState>,
    /// Serializes `start` / `stop`; owns the process.
    lifecycle: Mutex<Option<ProcessHandle>>,
    connection: RwLock<Option<ManagementConnection>>,
    address: RwLock<Option<ManagementAddr>>,
    exit: RwLock<Option<watch::Receiver<Option<ProcessExit>>>>,
    pid: RwLock<Option<u32>>,
    version: RwLock<Option<String>>,
}

impl Client {
    pub fn new(config: ClientConfig, chain: MiddlewareChain) -> Self {
        Self {
            config,
            chain,
            state: watch::channel(ClientState::Created).0,
            lifecycle: Mutex::new(None),
            connection: RwLock::new(None),
            address: RwLock::new(None),
            exit: RwLock::new(None),
            pid: RwLock::new(None),
            version: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().as_status()
    }

    /// The live management connection, while started.
    pub async fn connection(&self) -> Option<ManagementConnection> {
        self.connection.read().await.clone()
    }

    /// The resolved management address, once the process was launched.
    pub async fn management_address(&self) -> Option<ManagementAddr> {
        self.address.read().await.clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        *self.pid.read().await
    }

    /// OpenVPN release reported by the binary, if the last launch could read it.
    pub async fn openvpn_version(&self) -> Option<String> {
        self.version.read().await.clone()
    }

    fn set_state(&self, next: ClientState) {
        let prev = self.state.send_replace(next);
        log::debug!("[client] {} -> {}", prev, next);
    }

    /// Launch the process, connect and start the middleware chain.
    pub async fn start(&self) -> Result<(), MgmtError> {
        let mut process = self.lifecycle.lock().await;
        let current = self.state();
        if current != ClientState::Created {
            return Err(MgmtError::state(format!(
                "cannot start client in state {}",
                current
            )));
        }
        self.set_state(ClientState::Starting);

        match self.establish(&mut process).await {
            Ok(()) => {
                self.set_state(ClientState::Started);
                Ok(())
            }
            Err(cause) => {
                log::error!("[client] start failed: {}", cause);
                if let Some(conn) = self.connection.write().await.take() {
                    conn.close().await;
                }
                if let Some(handle) = process.take() {
                    handle.kill();
                    handle.wait().await;
                }
                self.set_state(ClientState::Failed);
                Err(MgmtError::start(cause))
            }
        }
    }

    async fn establish(&self, slot: &mut Option<ProcessHandle>) -> Result<(), MgmtError> {
        self.check_version().await;
        let address = self.config.management.resolve()?;
        let args = process::build_args(&self.config, &address);
        let handle = ProcessHandle::spawn(&self.config.binary, &args)?;
        *self.exit.write().await = Some(handle.exit_watch());
        *self.pid.write().await = handle.pid();
        *self.address.write().await = Some(address.clone());
        let handle = slot.insert(handle);

        let connection = self.dial(&address, handle).await?;
        *self.connection.write().await = Some(connection.clone());
        connection.start().await
    }

    /// Record the binary's version. Failure is logged, never fatal: a missing
    /// binary is reported by the spawn that follows.
    async fn check_version(&self) {
        let binary = &self.config.binary;
        match process::query_version(binary, VERSION_QUERY_TIMEOUT).await {
            Ok(version) => {
                log::info!("[client] {} is OpenVPN {}", binary.display(), version);
                *self.version.write().await = Some(version);
            }
            Err(e) => log::warn!("[client] cannot determine openvpn version: {}", e),
        }
    }

    /// Dial with bounded retry while the process brings up its listener.
    async fn dial(
        &self,
        address: &ManagementAddr,
        process: &ProcessHandle,
    ) -> Result<ManagementConnection, MgmtError> {
        let retry = &self.config.dial_retry;
        let mut attempt = 0;
        loop {
            let dialed = ManagementConnection::connect(
                address,
                self.chain.clone(),
                self.config.connection_settings(),
            )
            .await;
            let err = match dialed {
                Ok(connection) => return Ok(connection),
                Err(e) => e,
            };

            if let Some(exit) = process.try_exit() {
                return Err(MgmtError::process(format!(
                    "openvpn exited before the management interface came up: {}",
                    exit
                )));
            }
            if !retry.should_retry(attempt) {
                return Err(err);
            }
            let delay = retry.delay_for_attempt(attempt);
            log::debug!(
                "[client] management interface at {} not ready (attempt {}), retrying in {:?}",
                address,
                attempt + 1,
                delay
            );
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Ask OpenVPN to exit, tear down the connection and reap the process.
    pub async fn stop(&self) -> Result<(), MgmtError> {
        let mut process = self.lifecycle.lock().await;
        let current = self.state();
        if current != ClientState::Started {
            return Err(MgmtError::state(format!(
                "cannot stop client in state {}",
                current
            )));
        }
        self.set_state(ClientState::Stopping);
        let grace = self.config.stop_timeout();

        if let Some(conn) = self.connection.write().await.take() {
            if let Err(e) = conn
                .single_line_command(&MgmtCommands::signal("SIGTERM"))
                .await
            {
                log::warn!("[client] SIGTERM over management failed: {}", e);
            }
            if tokio::time::timeout(grace, conn.wait()).await.is_err() {
                log::warn!(
                    "[client] management stream still open after {:?}, closing",
                    grace
                );
            }
            conn.close().await;
        }

        if let Some(handle) = process.take() {
            if handle.wait_timeout(grace).await.is_none() {
                log::warn!("[client] openvpn did not exit after {:?}, killing", grace);
                handle.kill();
                handle.wait().await;
            }
        }

        self.set_state(ClientState::Stopped);
        Ok(())
    }

    /// Resolve when the process exits; non-zero exit is a `Process` error.
    pub async fn wait(&self) -> Result<(), MgmtError> {
        let exit = self
            .exit
            .read()
            .await
            .clone()
            .ok_or_else(|| MgmtError::state("client was never started"))?;

        let exit = process::wait_exit(exit).await;
        if exit.success {
            Ok(())
        } else {
            Err(MgmtError::process(format!(
                "openvpn exited abnormally: {}",
                exit
            )))
        }
    }
}
