//! Container runtime boundary
//!
//! The launcher never interprets what a service does. It hands a
//! [`StartRequest`] to a [`ContainerRuntime`] and supervises the returned
//! [`Container`] handle.

use crate::runtime::process::{EventSender, ManagedProcess, ProcessConfig, ProcessError, StopOutcome};
use crate::topology::{ExposedPort, LogConfig, MountSource, PortMapping, ServiceSpec, Topology};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Everything a runtime needs to start one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub service: String,
    pub project: String,
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub expose: BTreeSet<ExposedPort>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<ResolvedMount>,
    pub logging: LogConfig,
    /// Network to attach to; the service name is used as network alias
    pub network: Option<String>,
}

impl StartRequest {
    /// Build the request for a service of a topology
    pub fn from_service(
        spec: &ServiceSpec,
        topology: &Topology,
        project: &str,
        network: Option<&str>,
    ) -> Self {
        let mounts = spec
            .volumes
            .iter()
            .map(|mount| {
                let source = match &mount.source {
                    MountSource::Anonymous => None,
                    MountSource::HostPath(path) => Some(path.clone()),
                    MountSource::Named(name) => Some(
                        topology
                            .volumes
                            .get(name)
                            .map(|v| v.runtime_name(project))
                            .unwrap_or_else(|| name.clone()),
                    ),
                };
                ResolvedMount {
                    source,
                    target: mount.target.clone(),
                    read_only: mount.read_only,
                }
            })
            .collect();

        Self {
            service: spec.name.clone(),
            project: project.to_string(),
            container_name: spec
                .container_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}-1", project, spec.name)),
            image: spec.image.clone(),
            command: spec.command.clone(),
            environment: spec.environment.clone(),
            expose: spec.expose.clone(),
            ports: spec.ports.clone(),
            mounts,
            logging: spec.logging.clone(),
            network: network.map(str::to_string),
        }
    }
}

/// A mount whose source has been mapped to a runtime name or host path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    /// `None` for anonymous volumes
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

impl fmt::Display for ResolvedMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{}:", source)?;
        }
        write!(f, "{}", self.target)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

/// Exit status of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to a started container
#[async_trait]
pub trait Container: Send + fmt::Debug {
    /// Runtime identifier (container name or process id)
    fn id(&self) -> String;

    /// Check for exit without blocking
    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, RuntimeError>;

    /// Stop the container, waiting at most `timeout` before forcing it
    async fn stop(&mut self, timeout: Duration) -> Result<ExitStatus, RuntimeError>;
}

/// External collaborator that starts containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short runtime name for logs
    fn name(&self) -> &str;

    /// Command line this runtime would execute for a request
    fn command_line(&self, request: &StartRequest) -> Result<Vec<String>, RuntimeError>;

    /// Start a container; output is forwarded on `events`
    async fn start(
        &self,
        request: &StartRequest,
        events: EventSender,
    ) -> Result<Box<dyn Container>, RuntimeError>;
}

/// Runs containers through a docker-compatible CLI (`docker`, `podman`).
///
/// Each container runs attached to a foreground `run` client, and the
/// service counts as started once that client has been spawned. Failures the
/// engine reports afterwards (image pull, port conflict, usually exit code
/// 125) show up as an exit during supervision, not as a start error.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    engine: String,
}

impl CliRuntime {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    pub fn docker() -> Self {
        Self::new("docker")
    }

    /// Arguments after the engine binary.
    ///
    /// Environment values are not placed on the command line; `-e KEY` makes
    /// the engine read them from its own environment.
    fn run_args(&self, request: &StartRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            request.container_name.clone(),
            "--label".to_string(),
            format!("com.docker.compose.project={}", request.project),
            "--label".to_string(),
            format!("com.docker.compose.service={}", request.service),
        ];

        if let Some(network) = &request.network {
            args.extend([
                "--network".to_string(),
                network.clone(),
                "--network-alias".to_string(),
                request.service.clone(),
            ]);
        }

        for key in request.environment.keys() {
            args.extend(["-e".to_string(), key.clone()]);
        }
        for port in &request.expose {
            args.extend(["--expose".to_string(), port.to_string()]);
        }
        for mapping in &request.ports {
            args.extend(["-p".to_string(), mapping.to_string()]);
        }
        for mount in &request.mounts {
            args.extend(["-v".to_string(), mount.to_string()]);
        }

        args.extend(["--log-driver".to_string(), request.logging.driver.clone()]);
        for (key, value) in &request.logging.options {
            args.extend(["--log-opt".to_string(), format!("{}={}", key, value)]);
        }

        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.engine
    }

    fn command_line(&self, request: &StartRequest) -> Result<Vec<String>, RuntimeError> {
        let mut line = vec![self.engine.clone()];
        line.extend(self.run_args(request));
        Ok(line)
    }

    async fn start(
        &self,
        request: &StartRequest,
        events: EventSender,
    ) -> Result<Box<dyn Container>, RuntimeError> {
        let config = ProcessConfig {
            name: request.service.clone(),
            program: self.engine.clone(),
            args: self.run_args(request),
            env: request.environment.clone(),
        };
        let mut process = ManagedProcess::new(config).with_event_sender(events);
        process.spawn()?;

        Ok(Box::new(CliContainer {
            engine: self.engine.clone(),
            container_name: request.container_name.clone(),
            process,
        }))
    }
}

/// A container attached to a foreground CLI client process
#[derive(Debug)]
struct CliContainer {
    engine: String,
    container_name: String,
    process: ManagedProcess,
}

impl CliContainer {
    /// Remove the container directly; the client may have died without it
    async fn force_remove(&self) {
        let result = tokio::process::Command::new(&self.engine)
            .args(["rm", "-f", self.container_name.as_str()])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                log::info!("[{}] Removed container {}", self.process.config.name, self.container_name)
            }
            Ok(output) => log::warn!(
                "[{}] '{} rm -f {}' failed: {}",
                self.process.config.name,
                self.engine,
                self.container_name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => log::warn!("[{}] Could not run {}: {}", self.process.config.name, self.engine, e),
        }
    }
}

#[async_trait]
impl Container for CliContainer {
    fn id(&self) -> String {
        self.container_name.clone()
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, RuntimeError> {
        Ok(self.process.try_wait()?.map(|code| ExitStatus { code }))
    }

    async fn stop(&mut self, timeout: Duration) -> Result<ExitStatus, RuntimeError> {
        match self.process.stop(timeout).await? {
            StopOutcome::Exited(code) => Ok(ExitStatus { code }),
            StopOutcome::Killed => {
                self.force_remove().await;
                Ok(ExitStatus { code: None })
            }
        }
    }
}

/// Runs each service's command directly as a local process.
///
/// The image reference is informational only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRuntime;

impl ProcessRuntime {
    pub fn new() -> Self {
        Self
    }

    fn process_config(&self, request: &StartRequest) -> Result<ProcessConfig, RuntimeError> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| RuntimeError::EmptyCommand(request.service.clone()))?;

        Ok(ProcessConfig {
            name: request.service.clone(),
            program: program.clone(),
            args: args.to_vec(),
            env: request.environment.clone(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    fn command_line(&self, request: &StartRequest) -> Result<Vec<String>, RuntimeError> {
        let config = self.process_config(request)?;
        let mut line = vec![config.program];
        line.extend(config.args);
        Ok(line)
    }

    async fn start(
        &self,
        request: &StartRequest,
        events: EventSender,
    ) -> Result<Box<dyn Container>, RuntimeError> {
        if !request.mounts.is_empty() || !request.ports.is_empty() {
            log::debug!(
                "[{}] Process runtime ignores {} mounts and {} published ports",
                request.service,
                request.mounts.len(),
                request.ports.len()
            );
        }

        let mut process =
            ManagedProcess::new(self.process_config(request)?).with_event_sender(events);
        process.spawn()?;
        Ok(Box::new(process))
    }
}

#[async_trait]
impl Container for ManagedProcess {
    fn id(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid:{}", pid),
            None => format!("{} (exited)", self.config.name),
        }
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, RuntimeError> {
        Ok(ManagedProcess::try_wait(self)?.map(|code| ExitStatus { code }))
    }

    async fn stop(&mut self, timeout: Duration) -> Result<ExitStatus, RuntimeError> {
        let code = match ManagedProcess::stop(self, timeout).await? {
            StopOutcome::Exited(code) => code,
            StopOutcome::Killed => None,
        };
        Ok(ExitStatus { code })
    }
}

/// Errors reported by container runtimes
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Service '{0}' has no command to run")]
    EmptyCommand(String),
}
