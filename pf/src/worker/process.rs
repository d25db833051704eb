//! Process-backed browser
//!
//! Launches a driver executable per worker and talks to it over the
//! newline-delimited JSON protocol in [`super::protocol`]. The driver's stderr
//! goes to `<log-directory>/browser-<worker>.log`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::{BrowserConfig, Config};
use crate::domain::{CommandKind, Payload, WorkerId};
use crate::error::ManagerError;
use crate::util;

use super::browser::{Browser, BrowserFactory, BrowserIdentity, ExecError};
use super::error::WorkerCrashError;
use super::protocol::{DriverRequest, DriverResponse};

/// Factory for [`ProcessBrowser`]s
pub struct ProcessBrowserFactory {
    data_directory: PathBuf,
    log_directory: PathBuf,
}

impl ProcessBrowserFactory {
    /// Check every configured driver binary is installed
    pub fn new(config: &Config) -> Result<Self, ManagerError> {
        debug!("ProcessBrowserFactory::new: called");
        for (i, browser) in config.browsers.iter().enumerate() {
            if !util::is_installed(&browser.binary) {
                return Err(ManagerError::Configuration(format!(
                    "browser {} driver '{}' is not installed",
                    i,
                    browser.binary.display()
                )));
            }
        }
        Ok(Self {
            data_directory: config.manager.data_directory.clone(),
            log_directory: config.manager.log_directory.clone(),
        })
    }
}

impl BrowserFactory for ProcessBrowserFactory {
    fn create(&self, worker_id: WorkerId, config: &BrowserConfig) -> Box<dyn Browser> {
        let profile_dir = self
            .data_directory
            .join("profiles")
            .join(format!("worker-{}", worker_id.0));
        let log_path = self.log_directory.join(format!("browser-{}.log", worker_id.0));
        Box::new(ProcessBrowser::new(worker_id, config.clone(), profile_dir, log_path))
    }
}

/// Browser driven through a child process
pub struct ProcessBrowser {
    worker_id: WorkerId,
    config: BrowserConfig,
    profile_dir: PathBuf,
    log_path: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    next_request: u64,
}

impl ProcessBrowser {
    pub fn new(worker_id: WorkerId, config: BrowserConfig, profile_dir: PathBuf, log_path: PathBuf) -> Self {
        Self {
            worker_id,
            config,
            profile_dir,
            log_path,
            child: None,
            stdin: None,
            stdout: None,
            next_request: 0,
        }
    }

    async fn send(&mut self, request: &DriverRequest) -> Result<(), WorkerCrashError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerCrashError::ProcessExited("driver stdin closed".to_string()))?;
        let mut line = serde_json::to_string(request).map_err(|e| WorkerCrashError::Protocol(e.to_string()))?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<DriverResponse, WorkerCrashError> {
        loop {
            let line = match self.stdout.as_mut() {
                Some(stdout) => stdout.next_line().await?,
                None => return Err(WorkerCrashError::ProcessExited("driver stdout closed".to_string())),
            };
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    return serde_json::from_str(&line)
                        .map_err(|e| WorkerCrashError::Protocol(format!("{}: {}", e, line)));
                }
                None => return Err(WorkerCrashError::ProcessExited(self.exit_description())),
            }
        }
    }

    fn exit_description(&mut self) -> String {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => status.to_string(),
            _ => "driver closed its output".to_string(),
        }
    }
}

#[async_trait]
impl Browser for ProcessBrowser {
    async fn launch(&mut self) -> Result<BrowserIdentity, WorkerCrashError> {
        debug!(worker = %self.worker_id, binary = ?self.config.binary, "ProcessBrowser::launch: called");
        std::fs::create_dir_all(&self.profile_dir)?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        let mut child = Command::new(&self.config.binary)
            .args(&self.config.args)
            .env("PAGEFLEET_WORKER_ID", self.worker_id.0.to_string())
            .env("PAGEFLEET_DISPLAY_MODE", self.config.display_mode.to_string())
            .env("PAGEFLEET_PROFILE_DIR", &self.profile_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerCrashError::Launch(format!("{}: {}", self.config.binary.display(), e)))?;

        let pid = child.id();
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        self.child = Some(child);

        match self.receive().await? {
            DriverResponse::Ready => {
                info!(worker = %self.worker_id, ?pid, "Browser driver ready");
                Ok(BrowserIdentity {
                    pid,
                    label: format!("{} ({})", self.config.binary.display(), self.config.display_mode),
                })
            }
            other => Err(WorkerCrashError::Protocol(format!("expected Ready, got {:?}", other))),
        }
    }

    async fn execute(&mut self, command: &CommandKind) -> Result<Payload, ExecError> {
        debug!(worker = %self.worker_id, ?command, "ProcessBrowser::execute: called");
        match command {
            CommandKind::Visit { url } => {
                self.next_request += 1;
                let id = self.next_request;
                self.send(&DriverRequest::Visit { id, url: url.clone() }).await?;

                match self.receive().await? {
                    DriverResponse::Done { id: echoed, data, content } => {
                        check_echo(echoed, id)?;
                        Ok(Payload { data, content })
                    }
                    DriverResponse::Error { id: echoed, message } => {
                        check_echo(echoed, id)?;
                        Err(ExecError::Command(message))
                    }
                    DriverResponse::Ready => Err(WorkerCrashError::Protocol("unexpected Ready".to_string()).into()),
                }
            }
            CommandKind::Sleep { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                if !self.is_alive() {
                    return Err(WorkerCrashError::ProcessExited(self.exit_description()).into());
                }
                Ok(Payload::default())
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.child.as_mut().is_some_and(|c| matches!(c.try_wait(), Ok(None)))
    }

    async fn terminate(&mut self, grace: Duration) {
        debug!(worker = %self.worker_id, ?grace, "ProcessBrowser::terminate: called");
        if self.child.is_none() {
            return;
        }
        let _ = self.send(&DriverRequest::Shutdown).await;
        self.stdin = None;
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!(worker = %self.worker_id, %status, "ProcessBrowser::terminate: driver exited");
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            debug!(worker = %self.worker_id, pid, "ProcessBrowser::terminate: sending SIGTERM");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
        }

        warn!(worker = %self.worker_id, "Browser driver did not stop, killing");
        if let Err(e) = child.kill().await {
            warn!(worker = %self.worker_id, error = %e, "Failed to kill browser driver");
        }
    }
}

/// A reply naming a different request than the one in flight breaks the protocol
fn check_echo(echoed: Option<u64>, expected: u64) -> Result<(), WorkerCrashError> {
    match echoed {
        Some(echoed) if echoed != expected => Err(WorkerCrashError::Protocol(format!(
            "reply for request {} while waiting for {}",
            echoed, expected
        ))),
        _ => Ok(()),
    }
}
