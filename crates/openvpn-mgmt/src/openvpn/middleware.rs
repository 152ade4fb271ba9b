//! Middleware chain: pluggable observers of a management connection.
//!
//! A middleware is started once the read loop is running, sees every
//! real-time line until one of the chain claims it, and is stopped when the
//! connection is torn down.

use crate::openvpn::management::ManagementConnection;
use crate::openvpn::types::MgmtError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Observer of a management connection.
///
/// `consume_line` runs on the read loop and must not block; work that needs
/// to issue commands is spawned onto its own task.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn start(&self, connection: &ManagementConnection) -> Result<(), MgmtError>;

    async fn stop(&self, connection: &ManagementConnection) -> Result<(), MgmtError>;

    /// Returns `true` when the line was handled and must not be offered to
    /// later middlewares.
    fn consume_line(&self, line: &str) -> Result<bool, MgmtError>;
}

/// Ordered collection of middlewares owned by one connection.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("len", &self.middlewares.len())
            .finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Start every middleware in order. The first failure aborts; middlewares
    /// already started stay started.
    pub async fn start(&self, connection: &ManagementConnection) -> Result<(), MgmtError> {
        for (index, middleware) in self.middlewares.iter().enumerate() {
            if let Err(e) = middleware.start(connection).await {
                log::error!(
                    "[mgmt:{}] middleware #{} failed to start: {}",
                    connection.id(),
                    index,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every middleware in order, returning the errors encountered.
    pub async fn stop(&self, connection: &ManagementConnection) -> Vec<MgmtError> {
        let mut errors = Vec::new();
        for (index, middleware) in self.middlewares.iter().enumerate() {
            if let Err(e) = middleware.stop(connection).await {
                log::warn!(
                    "[mgmt:{}] middleware #{} failed to stop: {}",
                    connection.id(),
                    index,
                    e
                );
                errors.push(e);
            }
        }
        errors
    }

    /// Offer a real-time line to each middleware until one consumes it.
    pub fn consume_line(&self, line: &str) -> Result<bool, MgmtError> {
        for middleware in &self.middlewares {
            if middleware.consume_line(line)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingMiddleware;
    use super::*;
    use crate::openvpn::management::ConnectionSettings;

    fn idle_connection() -> (ManagementConnection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let conn = ManagementConnection::from_stream(
            client,
            "stub",
            MiddlewareChain::new(),
            ConnectionSettings::default(),
        );
        (conn, server)
    }

    #[test]
    fn builder_tracks_len() {
        let chain = MiddlewareChain::new();
        assert!(chain.is_empty());
        let mut chain = chain.with(Arc::new(RecordingMiddleware::default()));
        chain.push(Arc::new(RecordingMiddleware::default()));
        assert_eq!(chain.len(), 2);
        assert!(!chain.is_empty());
    }

    #[test]
    fn consume_stops_at_first_claim() {
        let first = Arc::new(RecordingMiddleware::default());
        let second = Arc::new(RecordingMiddleware::consuming());
        let third = Arc::new(RecordingMiddleware::default());
        let chain = MiddlewareChain::new()
            .with(first.clone())
            .with(second.clone())
            .with(third.clone());

        assert!(chain.consume_line(">INFO:x").unwrap());
        assert_eq!(first.lines(), vec![">INFO:x"]);
        assert_eq!(second.lines(), vec![">INFO:x"]);
        assert!(third.lines().is_empty());
    }

    #[test]
    fn unclaimed_line_is_reported() {
        let only = Arc::new(RecordingMiddleware::default());
        let chain = MiddlewareChain::new().with(only.clone());
        assert!(!chain.consume_line(">INFO:x").unwrap());
        assert!(!MiddlewareChain::new().consume_line(">INFO:x").unwrap());
    }

    #[test]
    fn consume_error_ends_the_line() {
        let failing = Arc::new(RecordingMiddleware {
            fail_on: Some(">BAD".into()),
            ..Default::default()
        });
        let after = Arc::new(RecordingMiddleware::default());
        let chain = MiddlewareChain::new().with(failing.clone()).with(after.clone());

        let err = chain.consume_line(">BAD").unwrap_err();
        assert_eq!(err.to_string(), "rejected >BAD");
        assert!(after.lines().is_empty());
    }

    #[tokio::test]
    async fn start_aborts_at_first_failure() {
        let (conn, _server) = idle_connection();
        let ok = Arc::new(RecordingMiddleware::default());
        let failing = Arc::new(RecordingMiddleware {
            fail_on: Some("start".into()),
            ..Default::default()
        });
        let never = Arc::new(RecordingMiddleware::default());
        let chain = MiddlewareChain::new()
            .with(ok.clone())
            .with(failing.clone())
            .with(never.clone());

        assert!(chain.start(&conn).await.is_err());
        assert_eq!(ok.events(), vec!["start"]);
        assert_eq!(failing.events(), vec!["start"]);
        assert!(never.events().is_empty());
    }

    #[tokio::test]
    async fn stop_visits_every_middleware() {
        let (conn, _server) = idle_connection();
        let failing = Arc::new(RecordingMiddleware {
            fail_on: Some("stop".into()),
            ..Default::default()
        });
        let after = Arc::new(RecordingMiddleware::default());
        let chain = MiddlewareChain::new().with(failing.clone()).with(after.clone());

        let errors = chain.stop(&conn).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(after.events(), vec!["stop"]);
    }
}
