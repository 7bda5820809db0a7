//! Managed child process abstraction

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Sender half of the shared process event channel
pub type EventSender = mpsc::UnboundedSender<(String, ProcessEvent)>;

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Service name (for logging and events)
    pub name: String,
    /// Program to execute
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables added to the inherited environment
    pub env: BTreeMap<String, String>,
}

/// Event emitted by a managed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Process started
    Started { pid: u32 },
    /// Process output line (stdout or stderr)
    Output { line: String, is_stderr: bool },
    /// Process exited
    Exited { code: Option<i32> },
    /// Process failed to start
    Failed { error: String },
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Process exited after SIGTERM (or had already exited)
    Exited(Option<i32>),
    /// Process ignored SIGTERM and was killed
    Killed,
}

/// A managed child process
#[derive(Debug)]
pub struct ManagedProcess {
    /// Process configuration
    pub config: ProcessConfig,
    /// Process ID (if running)
    pub pid: Option<u32>,
    child: Option<Child>,
    event_tx: Option<EventSender>,
}

impl ManagedProcess {
    /// Create a new, not yet spawned process
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            pid: None,
            child: None,
            event_tx: None,
        }
    }

    /// Set the event sender for this process
    pub fn with_event_sender(mut self, tx: EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send((self.config.name.clone(), event));
        }
    }

    /// Whether the process has been spawned and not yet reaped
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the process
    pub fn spawn(&mut self) -> Result<u32, ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyRunning(self.config.name.clone()));
        }

        log::debug!(
            "[{}] Spawning: {} {}",
            self.config.name,
            self.config.program,
            self.config.args.join(" ")
        );

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = format!("Failed to spawn process: {}", e);
                log::error!("[{}] {}", self.config.name, error);
                self.emit(ProcessEvent::Failed { error });
                return Err(ProcessError::SpawnFailed {
                    name: self.config.name.clone(),
                    source: e,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        self.pid = Some(pid);
        self.emit(ProcessEvent::Started { pid });

        if let Some(tx) = &self.event_tx {
            if let Some(stdout) = child.stdout.take() {
                forward_lines(self.config.name.clone(), stdout, false, tx.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(self.config.name.clone(), stderr, true, tx.clone());
            }
        }

        self.child = Some(child);
        Ok(pid)
    }

    /// Check whether the process has exited without blocking.
    ///
    /// Returns `Some(code)` once the process has been reaped.
    pub fn try_wait(&mut self) -> Result<Option<Option<i32>>, ProcessError> {
        let Some(child) = &mut self.child else {
            return Ok(None);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code();
                self.child = None;
                self.pid = None;
                self.emit(ProcessEvent::Exited { code });
                Ok(Some(code))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ProcessError::Wait {
                name: self.config.name.clone(),
                source: e,
            }),
        }
    }

    /// Stop the process gracefully (SIGTERM, then SIGKILL after timeout)
    pub async fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::Exited(None));
        };

        log::info!("[{}] Stopping process...", self.config.name);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let code = status.code();
                log::info!("[{}] Process exited with code: {:?}", self.config.name, code);
                self.emit(ProcessEvent::Exited { code });
                StopOutcome::Exited(code)
            }
            Ok(Err(e)) => {
                self.pid = None;
                return Err(ProcessError::Wait {
                    name: self.config.name.clone(),
                    source: e,
                });
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {:?}, forcing kill",
                    self.config.name,
                    timeout
                );
                if let Err(e) = child.kill().await {
                    log::error!("[{}] Failed to kill process: {}", self.config.name, e);
                }
                self.emit(ProcessEvent::Exited { code: None });
                StopOutcome::Killed
            }
        };

        self.pid = None;
        Ok(outcome)
    }
}

fn forward_lines<R>(name: String, stream: R, is_stderr: bool, tx: EventSender)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx
                .send((name.clone(), ProcessEvent::Output { line, is_stderr }))
                .is_err()
            {
                break;
            }
        }
    });
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
