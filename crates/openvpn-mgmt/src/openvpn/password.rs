//! Answers `>PASSWORD:` credential prompts (`--management-query-passwords`).

use crate::openvpn::management::ManagementConnection;
use crate::openvpn::middleware::Middleware;
use crate::openvpn::protocol::{self, MgmtCommands};
use crate::openvpn::types::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Source of credentials for a prompt type (`Auth`, `Private Key`, …).
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn credentials(&self, auth_type: &str) -> Result<Credentials, MgmtError>;
}

/// Returns the same credentials for every prompt.
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self, _auth_type: &str) -> Result<Credentials, MgmtError> {
        Ok(self.0.clone())
    }
}

/// A decoded `>PASSWORD:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordPrompt {
    /// `Need '<type>' username/password` (`username_needed`) or
    /// `Need '<type>' password`.
    Need {
        auth_type: String,
        username_needed: bool,
    },
    /// `Verification Failed: '<type>'`
    VerificationFailed { auth_type: String },
}

pub fn parse_password_prompt(payload: &str) -> Option<PasswordPrompt> {
    let need = regex::Regex::new(r"^Need '([^']+)' (username/password|password)").ok()?;
    if let Some(caps) = need.captures(payload) {
        return Some(PasswordPrompt::Need {
            auth_type: caps[1].to_string(),
            username_needed: &caps[2] == "username/password",
        });
    }
    let failed = regex::Regex::new(r"^Verification Failed: '([^']+)'").ok()?;
    failed
        .captures(payload)
        .map(|caps| PasswordPrompt::VerificationFailed {
            auth_type: caps[1].to_string(),
        })
}

/// Middleware replying to credential prompts on a spawned task.
pub struct PasswordMiddleware {
    provider: Arc<dyn CredentialsProvider>,
    connection: Mutex<Option<ManagementConnection>>,
    auth_failures: AtomicU32,
}

impl PasswordMiddleware {
    pub fn new(provider: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            provider,
            connection: Mutex::new(None),
            auth_failures: AtomicU32::new(0),
        }
    }

    /// Number of `Verification Failed` notifications seen.
    pub fn auth_failures(&self) -> u32 {
        self.auth_failures.load(Ordering::SeqCst)
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
}

async fn answer(
    connection: ManagementConnection,
    provider: Arc<dyn CredentialsProvider>,
    auth_type: String,
    username_needed: bool,
) -> Result<(), MgmtError> {
    let creds = provider.credentials(&auth_type).await?;
    if username_needed {
        connection
            .single_line_command(&MgmtCommands::username(&auth_type, &creds.username))
            .await?;
    }
    connection
        .single_line_command(&MgmtCommands::password(&auth_type, &creds.password))
        .await?;
    log::info!("[password:{}] credentials for '{}' sent", connection.id(), auth_type);
    Ok(())
}

#[async_trait]
impl Middleware for PasswordMiddleware {
    async fn start(&self, connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.set_connection(Some(connection.clone()));
        Ok(())
    }

    async fn stop(&self, _connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.set_connection(None);
        Ok(())
    }

    fn consume_line(&self, line: &str) -> Result<bool, MgmtError> {
        let Some(MgmtMessage::PasswordNeeded(payload)) = protocol::parse_mgmt_line(line) else {
            return Ok(false);
        };

        match parse_password_prompt(&payload) {
            Some(PasswordPrompt::Need {
                auth_type,
                username_needed,
            }) => {
                let connection = self
                    .connection()
                    .ok_or_else(|| MgmtError::state("password prompt before middleware start"))?;
                let provider = self.provider.clone();
                tokio::spawn(async move {
                    let id = connection.id().to_string();
                    if let Err(e) = answer(connection, provider, auth_type, username_needed).await {
                        log::error!("[password:{}] answering prompt failed: {}", id, e);
                    }
                });
                Ok(true)
            }
            Some(PasswordPrompt::VerificationFailed { auth_type }) => {
                let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "[password] verification failed for '{}' ({} so far)",
                    auth_type,
                    failures
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
