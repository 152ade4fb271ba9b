//! OpenVPN process lifecycle – argument building, spawn, exit reaping, kill.

use crate::openvpn::config::{ClientConfig, ManagementAddr};
use crate::openvpn::protocol::LineReader;
use crate::openvpn::types::*;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Argument builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the full command line: the configured arguments followed by the
/// management options.
pub fn build_args(cfg: &ClientConfig, addr: &ManagementAddr) -> Vec<String> {
    let mut args = cfg.args.clone();
    args.extend(addr.to_args());
    if cfg.query_passwords {
        args.push("--management-query-passwords".into());
    }
    args
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Process handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

impl ProcessExit {
    fn from_wait(result: std::io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                success: status.success(),
                description: status.to_string(),
            },
            Err(e) => Self {
                code: None,
                success: false,
                description: format!("wait failed: {}", e),
            },
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// A spawned OpenVPN process. A reaper task owns the child and publishes
/// its exit; dropping the handle kills the process.
pub struct ProcessHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
    _kill_on_drop: DropGuard,
}

impl ProcessHandle {
    pub fn spawn(binary: &Path, args: &[String]) -> Result<Self, MgmtError> {
        let mut child = tokio::process::Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MgmtError::process(format!("failed to spawn {}", binary.display()))
                    .with_detail(e.to_string())
            })?;

        let pid = child.id();
        let tag = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
        log::info!("[openvpn:{}] spawned {} {}", tag, binary.display(), args.join(" "));

        if let Some(stdout) = child.stdout.take() {
            forward_output(tag.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(tag.clone(), stderr, true);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_requested = kill.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = child.wait() => result,
                _ = kill_requested.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        log::warn!("[openvpn:{}] kill failed: {}", tag, e);
                    }
                    child.wait().await
                }
            };
            let exit = ProcessExit::from_wait(result);
            log::info!("[openvpn:{}] exited: {}", tag, exit);
            exit_tx.send_replace(Some(exit));
        });

        Ok(Self {
            pid,
            exit: exit_rx,
            _kill_on_drop: kill.clone().drop_guard(),
            kill,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a kill. The exit is still published through `wait`.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    /// A receiver that observes the exit independently of this handle.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    pub async fn wait(&self) -> ProcessExit {
        wait_exit(self.exit.clone()).await
    }

    pub async fn wait_timeout(&self, limit: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }
}

/// Wait until an exit is published on `exit`.
pub async fn wait_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    let published = exit
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|published| published.clone());
    published.unwrap_or_else(reaper_gone)
}

fn reaper_gone() -> ProcessExit {
    ProcessExit {
        code: None,
        success: false,
        description: "process reaper ended without an exit status".into(),
    }
}

fn forward_output<R>(tag: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(stream);
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log::warn!("[openvpn:{}] {}", tag, line);
            } else {
                log::debug!("[openvpn:{}] {}", tag, line);
            }
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run `<binary> --version` and pull the release number out of its banner.
///
/// The child gets no stdin and is killed if it outlives `limit`.
pub async fn query_version(binary: &Path, limit: Duration) -> Result<String, MgmtError> {
    let run = tokio::process::Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(limit, run)
        .await
        .map_err(|_| {
            MgmtError::process(format!(
                "{} --version did not finish within {:?}",
                binary.display(),
                limit
            ))
        })?
        .map_err(|e| {
            MgmtError::process(format!("failed to run {} --version", binary.display()))
                .with_detail(e.to_string())
        })?;

    // OpenVPN prints the banner to stdout; some builds route it to stderr.
    let version = [&output.stdout, &output.stderr]
        .into_iter()
        .find_map(|out| parse_version_string(&String::from_utf8_lossy(out)))
        .ok_or_else(|| {
            MgmtError::parse(format!("no OpenVPN banner in {} --version", binary.display()))
        });
    version
}

/// Parse an OpenVPN version banner (e.g. "OpenVPN 2.6.8 x86_64-pc-linux-gnu").
pub fn parse_version_string(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"OpenVPN\s+(\d+\.\d+\.\d+)").ok()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Find a free TCP port for the management interface.
pub fn find_free_mgmt_port() -> Result<u16, MgmtError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
        MgmtError::connection("cannot bind to ephemeral port").with_detail(e.to_string())
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| MgmtError::connection("cannot get local addr").with_detail(e.to_string()))?
        .port();
    Ok(port)
}
