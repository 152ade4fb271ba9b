//! End-to-end lifecycle tests against the `openvpn-emulator` binary.

use async_trait::async_trait;
use openvpn_mgmt::openvpn::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EMULATOR: &str = env!("CARGO_BIN_EXE_openvpn-emulator");

const EXPECTED_LINES: &[&str] = &[
    ">INFO:OpenVPN Management Interface Version 1 -- type 'help' for more info",
    ">PASSWORD:Need 'Auth' username/password",
    ">STATE:1522855903,CONNECTING,,,,,,",
    ">STATE:1522855903,WAIT,,,,,,",
    ">STATE:1522855903,AUTH,,,,,,",
    ">STATE:1522855904,GET_CONFIG,,,,,,",
    ">STATE:1522855904,ASSIGN_IP,,10.8.0.133,,,,",
    ">STATE:1522855905,CONNECTED,SUCCESS,10.8.0.133,1.2.3.4,1194,,",
    ">BYTECOUNT:36987,32252",
    ">STATE:1522855911,EXITING,SIGTERM,,,,,",
];

#[derive(Default)]
struct CollectingMiddleware {
    events: Mutex<Vec<String>>,
}

impl CollectingMiddleware {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn line_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with('>'))
            .count()
    }
}

#[async_trait]
impl Middleware for CollectingMiddleware {
    async fn start(&self, _connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.events.lock().unwrap().push("start".into());
        Ok(())
    }

    async fn stop(&self, _connection: &ManagementConnection) -> Result<(), MgmtError> {
        self.events.lock().unwrap().push("stop".into());
        Ok(())
    }

    fn consume_line(&self, line: &str) -> Result<bool, MgmtError> {
        self.events.lock().unwrap().push(line.to_string());
        Ok(true)
    }
}

fn emulator_config(extra: &[&str]) -> ClientConfig {
    let mut cfg = ClientConfig::new(EMULATOR).with_args(extra.iter().copied());
    cfg.stop_timeout_ms = 3_000;
    cfg
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Event delivery ──────────────────────────────────────────────

#[tokio::test]
async fn middleware_sees_every_line_in_order() {
    let collector = Arc::new(CollectingMiddleware::default());
    let client = Client::new(
        emulator_config(&[]),
        MiddlewareChain::new().with(collector.clone()),
    );

    client.start().await.unwrap();
    assert_eq!(client.state(), ClientState::Started);
    assert_eq!(client.status().state, State::Connected);
    assert!(client.pid().await.is_some());
    assert_eq!(client.openvpn_version().await.as_deref(), Some("2.6.8"));

    eventually(|| collector.line_count() == 9).await;
    client.stop().await.unwrap();
    client.wait().await.unwrap();

    let mut expected = vec!["start".to_string()];
    expected.extend(EXPECTED_LINES.iter().map(|l| l.to_string()));
    expected.push("stop".into());
    assert_eq!(collector.events(), expected);
    assert_eq!(client.state(), ClientState::Stopped);
}

// ── Commands ────────────────────────────────────────────────────

#[tokio::test]
async fn commands_round_trip() {
    let client = Client::new(emulator_config(&[]), MiddlewareChain::new());
    client.start().await.unwrap();
    let conn = client.connection().await.unwrap();

    assert_eq!(
        conn.single_line_command("SINGLELINE_CMD").await.unwrap(),
        "SINGLELINE_CMD_OK"
    );

    let (status, lines) = conn.multi_line_command("MULTILINE_CMD").await.unwrap();
    assert_eq!(status, "MULTILINE_CMD_OK");
    assert_eq!(lines, vec!["LINE1", "LINE2"]);

    let err = conn.single_line_command("BAD_COMMAND").await.unwrap_err();
    assert_eq!(err.kind, MgmtErrorKind::Command);
    assert_eq!(err.to_string(), "command error: Unknown command BAD_COMMAND");

    client.stop().await.unwrap();
    client.wait().await.unwrap();
}

#[tokio::test]
async fn state_tracker_follows_emulator() {
    let tracker = Arc::new(StateTracker::new().with_bytecount(5));
    let client = Client::new(
        emulator_config(&[]),
        MiddlewareChain::new().with(tracker.clone()),
    );
    client.start().await.unwrap();

    let mut updates = tracker.subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        updates.wait_for(|s| s.bytes_in == 36987),
    )
    .await
    .unwrap()
    .unwrap();
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.state, State::Connected);
    assert_eq!(snapshot.local_ip.as_deref(), Some("10.8.0.133"));

    client.stop().await.unwrap();
    assert_eq!(tracker.status().state, State::NotConnected);
}

// ── Lifecycle errors ────────────────────────────────────────────

#[tokio::test]
async fn invalid_transitions_are_state_errors() {
    let client = Client::new(emulator_config(&[]), MiddlewareChain::new());
    assert_eq!(
        client.stop().await.unwrap_err().kind,
        MgmtErrorKind::State
    );

    client.start().await.unwrap();
    assert_eq!(
        client.start().await.unwrap_err().kind,
        MgmtErrorKind::State
    );

    client.stop().await.unwrap();
    assert_eq!(
        client.stop().await.unwrap_err().kind,
        MgmtErrorKind::State
    );
    assert_eq!(client.state(), ClientState::Stopped);
}

#[tokio::test]
async fn concurrent_stop_runs_once() {
    let collector = Arc::new(CollectingMiddleware::default());
    let client = Client::new(
        emulator_config(&[]),
        MiddlewareChain::new().with(collector.clone()),
    );
    client.start().await.unwrap();

    let (a, b) = tokio::join!(client.stop(), client.stop());
    assert!(a.is_ok() != b.is_ok());
    let stops = collector.events().iter().filter(|e| *e == "stop").count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn emulator_reports_version_banner() {
    let version = process::query_version(std::path::Path::new(EMULATOR), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(version, "2.6.8");
}

#[tokio::test]
async fn missing_binary_fails_start() {
    let client = Client::new(
        ClientConfig::new("/nonexistent/openvpn"),
        MiddlewareChain::new(),
    );
    let err = client.start().await.unwrap_err();
    assert_eq!(err.kind, MgmtErrorKind::Start);
    assert_eq!(client.state(), ClientState::Failed);
}

#[tokio::test]
async fn abnormal_exit_is_reported_by_wait() {
    let client = Client::new(emulator_config(&["--exit-code", "3"]), MiddlewareChain::new());
    client.start().await.unwrap();
    client.stop().await.unwrap();

    let err = client.wait().await.unwrap_err();
    assert_eq!(err.kind, MgmtErrorKind::Process);
}

#[tokio::test]
async fn dial_retries_until_listener_is_up() {
    let client = Client::new(
        emulator_config(&["--listen-delay-ms", "300"]),
        MiddlewareChain::new(),
    );
    client.start().await.unwrap();
    assert_eq!(client.state(), ClientState::Started);
    client.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_management() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mgmt.sock");
    let cfg = emulator_config(&[]).with_management(ManagementAddr::unix(&socket));
    let client = Client::new(cfg, MiddlewareChain::new());

    client.start().await.unwrap();
    assert_eq!(
        client.management_address().await,
        Some(ManagementAddr::unix(&socket))
    );
    let conn = client.connection().await.unwrap();
    assert_eq!(
        conn.single_line_command("SINGLELINE_CMD").await.unwrap(),
        "SINGLELINE_CMD_OK"
    );
    client.stop().await.unwrap();
    client.wait().await.unwrap();
}
