//! Launcher - starts a topology in dependency order and supervises it

use crate::config::RestartPolicy;
use crate::runtime::container::{Container, ContainerRuntime, ExitStatus, RuntimeError, StartRequest};
use crate::runtime::dependency::{DependencyError, DependencyGraph};
use crate::runtime::process::{EventSender, ProcessEvent};
use crate::topology::Topology;
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How often supervised containers are polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound for the restart backoff
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

/// Launcher configuration
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Project name used to scope container and volume names
    pub project_name: String,
    /// Network every container joins (created outside the launcher)
    pub network: Option<String>,
    /// Services to launch together with their dependencies (empty = all)
    pub services: Vec<String>,
    /// Time a service gets to exit after SIGTERM
    pub shutdown_timeout: Duration,
    /// Initial delay before restarting an exited service
    pub restart_delay: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            network: None,
            services: Vec::new(),
            shutdown_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// Project name derived from the current directory, lowercased and sanitized
pub fn default_project_name() -> String {
    let dir = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let name = sanitize_project_name(&dir);
    if name.is_empty() {
        "topology".to_string()
    } else {
        name
    }
}

/// Keep only characters valid in a project name
pub fn sanitize_project_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect()
}

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    /// Waiting for dependencies
    Pending,
    /// Runtime has been asked to start the service
    Starting,
    /// Runtime reported the service as started
    Started,
    /// Stopped by the launcher or exited with code 0
    Stopped,
    /// Failed to start, or exited with a non-zero code or a signal
    Crashed(Option<i32>),
}

impl ServiceState {
    /// Whether the service occupies a running container
    pub fn is_active(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Started)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Crashed(Some(code)) => write!(f, "crashed (exit {})", code),
            ServiceState::Crashed(None) => write!(f, "crashed"),
        }
    }
}

/// Whether a service that exited on its own should be restarted.
///
/// Exits are only observed while supervising and `stop` cancels pending
/// restarts, so `unless-stopped` decides like `always`.
pub fn should_restart(policy: RestartPolicy, exit: ExitStatus) -> bool {
    match policy {
        RestartPolicy::No => false,
        RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
        RestartPolicy::OnFailure => !exit.success(),
    }
}

/// Starts topologies through a container runtime
pub struct Launcher {
    runtime: Arc<dyn ContainerRuntime>,
    config: LauncherConfig,
}

/// Result of a single service's start task
enum StartOutcome {
    Started(Box<dyn Container>, DateTime<Local>),
    Failed(RuntimeError),
    DependencyFailed(String),
}

impl Launcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: LauncherConfig) -> Self {
        Self { runtime, config }
    }

    fn graph(&self, topology: &Topology) -> Result<DependencyGraph, DependencyError> {
        if self.config.services.is_empty() {
            DependencyGraph::build(topology)
        } else {
            DependencyGraph::for_services(topology, &self.config.services)
        }
    }

    fn requests(
        &self,
        topology: &Topology,
        graph: &DependencyGraph,
    ) -> Result<IndexMap<String, StartRequest>, LaunchError> {
        let mut requests = IndexMap::new();
        for name in graph.launch_order() {
            let spec = topology
                .service(name)
                .ok_or_else(|| DependencyError::UnknownService(name.to_string()))?;
            requests.insert(
                name.to_string(),
                StartRequest::from_service(
                    spec,
                    topology,
                    &self.config.project_name,
                    self.config.network.as_deref(),
                ),
            );
        }
        Ok(requests)
    }

    /// Describe what `start` would do without starting anything
    pub fn plan(&self, topology: &Topology) -> Result<LaunchPlan, LaunchError> {
        let graph = self.graph(topology)?;
        let requests = self.requests(topology, &graph)?;

        let mut services = Vec::with_capacity(requests.len());
        for (name, request) in &requests {
            let command_line = self
                .runtime
                .command_line(request)
                .map_err(|source| LaunchError::Plan {
                    service: name.clone(),
                    source,
                })?;
            let restart = topology
                .service(name)
                .map(|s| s.restart)
                .unwrap_or_default();

            services.push(LaunchPlanService {
                name: name.clone(),
                image: request.image.clone(),
                container_name: request.container_name.clone(),
                depends_on: graph
                    .dependencies_of(name)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                command_line,
                environment: request.environment.clone(),
                restart: restart.as_str().to_string(),
            });
        }

        Ok(LaunchPlan {
            project: self.config.project_name.clone(),
            runtime: self.runtime.name().to_string(),
            version: topology.version.clone(),
            services,
        })
    }

    /// Start every service once all of its dependencies have started.
    ///
    /// Services whose dependencies are satisfied start concurrently. There is
    /// no readiness check and no timeout: a dependency counts as satisfied as
    /// soon as the runtime reports it started. On failure nothing is rolled
    /// back; the services that did start are returned inside the error.
    pub async fn start(&self, topology: &Topology) -> Result<RunningSet, LaunchError> {
        let graph = self.graph(topology)?;
        let requests = self.requests(topology, &graph)?;

        log::info!(
            "Starting {} services with runtime '{}'...",
            graph.len(),
            self.runtime.name()
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (order_tx, mut order_rx) = mpsc::unbounded_channel::<String>();

        let mut state_rx: HashMap<String, watch::Receiver<ServiceState>> = HashMap::new();
        let mut state_tx: HashMap<String, watch::Sender<ServiceState>> = HashMap::new();
        for name in graph.launch_order() {
            let (tx, rx) = watch::channel(ServiceState::Pending);
            state_tx.insert(name.to_string(), tx);
            state_rx.insert(name.to_string(), rx);
        }

        let mut handles: Vec<(String, JoinHandle<StartOutcome>)> = Vec::with_capacity(graph.len());
        for (name, request) in &requests {
            let mut dependencies = Vec::new();
            for dep in graph.dependencies_of(name) {
                let rx = state_rx
                    .get(dep)
                    .cloned()
                    .ok_or_else(|| DependencyError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.to_string(),
                    })?;
                dependencies.push((dep.to_string(), rx));
            }

            let Some(tx) = state_tx.remove(name) else {
                continue;
            };

            let handle = tokio::spawn(start_service(
                name.clone(),
                request.clone(),
                dependencies,
                tx,
                Arc::clone(&self.runtime),
                event_tx.clone(),
                order_tx.clone(),
            ));
            handles.push((name.clone(), handle));
        }
        drop(order_tx);

        let mut services: IndexMap<String, ManagedService> = IndexMap::new();
        let mut failures = Vec::new();

        for (name, handle) in handles {
            let restart = topology
                .service(&name)
                .map(|s| s.restart)
                .unwrap_or_default();
            let request = requests[&name].clone();
            let mut service = ManagedService::new(request, restart);

            match handle.await {
                Ok(StartOutcome::Started(container, started_at)) => {
                    log::info!("[{}] Started ({})", name, container.id());
                    service.state = ServiceState::Started;
                    service.container = Some(container);
                    service.started_at = Some(started_at);
                }
                Ok(StartOutcome::Failed(source)) => {
                    log::error!("[{}] Failed to start: {}", name, source);
                    service.state = ServiceState::Crashed(None);
                    failures.push(ServiceLaunchError::Runtime {
                        service: name.clone(),
                        source,
                    });
                }
                Ok(StartOutcome::DependencyFailed(dependency)) => {
                    log::warn!(
                        "[{}] Not started because dependency '{}' did not start",
                        name,
                        dependency
                    );
                    failures.push(ServiceLaunchError::DependencyFailed {
                        service: name.clone(),
                        dependency,
                    });
                }
                Err(e) => {
                    log::error!("[{}] Start task failed: {}", name, e);
                    service.state = ServiceState::Crashed(None);
                    failures.push(ServiceLaunchError::Aborted {
                        service: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            services.insert(name, service);
        }

        let mut start_order = Vec::with_capacity(services.len());
        while let Some(name) = order_rx.recv().await {
            start_order.push(name);
        }

        let running = RunningSet {
            graph,
            services,
            start_order,
            runtime: Arc::clone(&self.runtime),
            event_tx,
            event_rx,
            shutdown_timeout: self.config.shutdown_timeout,
            restart_delay: self.config.restart_delay,
        };

        if failures.is_empty() {
            log::info!("All {} services started", running.len());
            Ok(running)
        } else {
            Err(LaunchError::Partial {
                failures,
                running: Box::new(running),
            })
        }
    }
}

/// Wait for every dependency to start, then start one service
async fn start_service(
    name: String,
    request: StartRequest,
    dependencies: Vec<(String, watch::Receiver<ServiceState>)>,
    state: watch::Sender<ServiceState>,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventSender,
    order: mpsc::UnboundedSender<String>,
) -> StartOutcome {
    for (dep, mut rx) in dependencies {
        log::debug!("[{}] Waiting for '{}'", name, dep);
        let settled = rx
            .wait_for(|s| !matches!(s, ServiceState::Pending | ServiceState::Starting))
            .await
            .map(|s| *s);
        if !matches!(settled, Ok(ServiceState::Started)) {
            // Dropping `state` releases our own dependents
            return StartOutcome::DependencyFailed(dep);
        }
    }

    state.send_replace(ServiceState::Starting);
    let _ = order.send(name.clone());
    log::info!("[{}] Starting {}", name, request.image);

    match runtime.start(&request, events).await {
        Ok(container) => {
            state.send_replace(ServiceState::Started);
            StartOutcome::Started(container, Local::now())
        }
        Err(e) => {
            state.send_replace(ServiceState::Crashed(None));
            StartOutcome::Failed(e)
        }
    }
}

/// Per-service bookkeeping inside a running set
struct ManagedService {
    request: StartRequest,
    restart: RestartPolicy,
    state: ServiceState,
    container: Option<Box<dyn Container>>,
    started_at: Option<DateTime<Local>>,
    restart_count: u32,
    restart_at: Option<Instant>,
}

impl ManagedService {
    fn new(request: StartRequest, restart: RestartPolicy) -> Self {
        Self {
            request,
            restart,
            state: ServiceState::Pending,
            container: None,
            started_at: None,
            restart_count: 0,
            restart_at: None,
        }
    }
}

/// Snapshot of one service's status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub container: Option<String>,
    pub restart_count: u32,
    pub started_at: Option<String>,
}

/// The set of services brought up by [`Launcher::start`]
pub struct RunningSet {
    graph: DependencyGraph,
    services: IndexMap<String, ManagedService>,
    start_order: Vec<String>,
    runtime: Arc<dyn ContainerRuntime>,
    event_tx: EventSender,
    event_rx: mpsc::UnboundedReceiver<(String, ProcessEvent)>,
    shutdown_timeout: Duration,
    restart_delay: Duration,
}

impl fmt::Debug for RunningSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningSet")
            .field("runtime", &self.runtime.name())
            .field("start_order", &self.start_order)
            .field(
                "states",
                &self
                    .services
                    .iter()
                    .map(|(name, s)| (name.as_str(), s.state))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RunningSet {
    /// Number of services in the set
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Order in which services entered `Starting`
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// Current state of a service
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|s| s.state)
    }

    /// Number of services currently started
    pub fn started_count(&self) -> usize {
        self.services
            .values()
            .filter(|s| s.state == ServiceState::Started)
            .count()
    }

    /// Status summary in launch order
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services
            .iter()
            .map(|(name, s)| ServiceStatus {
                name: name.clone(),
                state: s.state,
                container: s.container.as_ref().map(|c| c.id()),
                restart_count: s.restart_count,
                started_at: s.started_at.map(|t| t.to_rfc3339()),
            })
            .collect()
    }

    /// Check every started service for exit and schedule restarts
    pub async fn poll(&mut self) {
        let now = Instant::now();
        for (name, service) in self.services.iter_mut() {
            let Some(container) = service.container.as_mut() else {
                continue;
            };

            let exit = match container.try_wait().await {
                Ok(Some(exit)) => exit,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("[{}] Error checking status: {}", name, e);
                    continue;
                }
            };

            service.container = None;
            service.state = if exit.success() {
                ServiceState::Stopped
            } else {
                ServiceState::Crashed(exit.code)
            };
            log::warn!("[{}] Exited: {}", name, service.state);

            if should_restart(service.restart, exit) {
                let delay = backoff(self.restart_delay, service.restart_count);
                log::info!(
                    "[{}] Restarting in {:?} (restart: {})",
                    name,
                    delay,
                    service.restart.as_str()
                );
                service.restart_at = Some(now + delay);
            }
        }

        self.restart_due().await;
    }

    async fn restart_due(&mut self) {
        let now = Instant::now();
        for (name, service) in self.services.iter_mut() {
            match service.restart_at {
                Some(at) if at <= now => {}
                _ => continue,
            }

            service.restart_at = None;
            service.restart_count += 1;
            service.state = ServiceState::Starting;

            match self.runtime.start(&service.request, self.event_tx.clone()).await {
                Ok(container) => {
                    log::info!(
                        "[{}] Restarted ({}), restart #{}",
                        name,
                        container.id(),
                        service.restart_count
                    );
                    service.container = Some(container);
                    service.state = ServiceState::Started;
                    service.started_at = Some(Local::now());
                }
                Err(e) => {
                    log::error!("[{}] Restart failed: {}", name, e);
                    service.state = ServiceState::Crashed(None);
                    let delay = backoff(self.restart_delay, service.restart_count);
                    service.restart_at = Some(Instant::now() + delay);
                }
            }
        }
    }

    /// Whether anything is running or scheduled to restart
    pub fn has_live_services(&self) -> bool {
        self.services
            .values()
            .any(|s| s.state.is_active() || s.restart_at.is_some())
    }

    /// Forward container output and restart exited services until shutdown
    /// is signalled or nothing is left to supervise
    pub async fn supervise(&mut self, mut shutdown_rx: watch::Receiver<()>) {
        // Created once: output events must not push back exit polling
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("Shutdown signal received");
                    break;
                }

                event = self.event_rx.recv() => {
                    if let Some((name, event)) = event {
                        log_event(&name, event);
                    }
                }

                _ = tick.tick() => {
                    self.poll().await;
                    if !self.has_live_services() {
                        log::info!("All services have stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Stop every service in reverse dependency order.
    ///
    /// Each stop is bounded by the shutdown timeout; errors are logged and
    /// do not prevent the remaining services from being stopped.
    pub async fn stop(&mut self) {
        log::info!("Stopping {} services...", self.started_count());

        let order: Vec<String> = self.graph.shutdown_order().map(str::to_string).collect();
        for name in order {
            let Some(service) = self.services.get_mut(&name) else {
                continue;
            };
            service.restart_at = None;

            let Some(mut container) = service.container.take() else {
                continue;
            };

            match container.stop(self.shutdown_timeout).await {
                Ok(exit) => log::info!("[{}] Stopped (exit code {:?})", name, exit.code),
                Err(e) => log::error!("[{}] Error stopping: {}", name, e),
            }
            service.state = ServiceState::Stopped;
        }

        while let Ok((name, event)) = self.event_rx.try_recv() {
            log_event(&name, event);
        }

        log::info!("All services stopped");
    }
}

fn backoff(base: Duration, restarts: u32) -> Duration {
    base.saturating_mul(1u32 << restarts.min(5)).min(MAX_RESTART_DELAY)
}

fn log_event(name: &str, event: ProcessEvent) {
    match event {
        ProcessEvent::Output { line, is_stderr } => {
            if is_stderr {
                log::warn!("[{}] {}", name, line);
            } else {
                log::info!("[{}] {}", name, line);
            }
        }
        ProcessEvent::Exited { code } => {
            log::debug!("[{}] Process exited with code: {:?}", name, code);
        }
        ProcessEvent::Failed { error } => {
            log::error!("[{}] Process failed: {}", name, error);
        }
        ProcessEvent::Started { pid } => {
            log::debug!("[{}] Process started with PID: {}", name, pid);
        }
    }
}

/// Why a single service did not start
#[derive(Debug, thiserror::Error)]
pub enum ServiceLaunchError {
    #[error("Service '{service}' failed to start: {source}")]
    Runtime {
        service: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Service '{service}' was not started because '{dependency}' did not start")]
    DependencyFailed { service: String, dependency: String },

    #[error("Start of service '{service}' was aborted: {reason}")]
    Aborted { service: String, reason: String },
}

impl ServiceLaunchError {
    pub fn service(&self) -> &str {
        match self {
            ServiceLaunchError::Runtime { service, .. }
            | ServiceLaunchError::DependencyFailed { service, .. }
            | ServiceLaunchError::Aborted { service, .. } => service,
        }
    }
}

/// Errors that can occur when launching a topology
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Cannot resolve launch order: {0}")]
    Order(#[from] DependencyError),

    #[error("Cannot plan service '{service}': {source}")]
    Plan {
        service: String,
        #[source]
        source: RuntimeError,
    },

    /// Some services failed; the ones that started are still running
    #[error("{} service(s) failed to launch: {}", .failures.len(), failed_names(.failures))]
    Partial {
        failures: Vec<ServiceLaunchError>,
        running: Box<RunningSet>,
    },
}

fn failed_names(failures: &[ServiceLaunchError]) -> String {
    failures
        .iter()
        .map(ServiceLaunchError::service)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Launch plan for dry-run mode
#[derive(Debug, Serialize)]
pub struct LaunchPlan {
    pub project: String,
    pub runtime: String,
    pub version: String,
    /// Services in launch order
    pub services: Vec<LaunchPlanService>,
}

/// A service in the launch plan
#[derive(Debug, Serialize)]
pub struct LaunchPlanService {
    pub name: String,
    pub image: String,
    pub container_name: String,
    pub depends_on: Vec<String>,
    pub command_line: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub restart: String,
}

/// Display the launch plan in a human-readable format
impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;
        writeln!(f, "Project: {}", self.project)?;
        writeln!(f, "Runtime: {}", self.runtime)?;
        writeln!(f, "Version: {}", self.version)?;
        writeln!(f)?;

        writeln!(f, "Services (in launch order):")?;
        for (i, service) in self.services.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {} [{}]", i + 1, service.name, service.image)?;
            writeln!(f, "     Container: {}", service.container_name)?;
            writeln!(f, "     Command: {}", service.command_line.join(" "))?;

            if !service.depends_on.is_empty() {
                writeln!(f, "     Depends on: {}", service.depends_on.join(", "))?;
            }

            writeln!(f, "     Restart: {}", service.restart)?;

            if !service.environment.is_empty() {
                writeln!(f, "     Environment:")?;
                for key in service.environment.keys() {
                    writeln!(f, "       {}", key)?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: Option<i32>) -> ExitStatus {
        ExitStatus { code }
    }

    #[test]
    fn test_restart_policy_decisions() {
        assert!(!should_restart(RestartPolicy::No, exit(Some(1))));
        assert!(should_restart(RestartPolicy::Always, exit(Some(0))));
        assert!(should_restart(RestartPolicy::OnFailure, exit(Some(1))));
        assert!(should_restart(RestartPolicy::OnFailure, exit(None)));
        assert!(!should_restart(RestartPolicy::OnFailure, exit(Some(0))));
    }

    #[test]
    fn test_unless_stopped_decides_like_always() {
        for code in [Some(0), Some(1), None] {
            assert_eq!(
                should_restart(RestartPolicy::UnlessStopped, exit(code)),
                should_restart(RestartPolicy::Always, exit(code))
            );
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff(base, 0), Duration::from_secs(1));
        assert_eq!(backoff(base, 2), Duration::from_secs(4));
        assert_eq!(backoff(base, 40), MAX_RESTART_DELAY);
    }

    #[test]
    fn test_sanitize_project_name() {
        assert_eq!(sanitize_project_name("Anchore Engine!"), "anchoreengine");
        assert_eq!(sanitize_project_name("my_stack-2"), "my_stack-2");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Crashed(Some(2)).to_string(), "crashed (exit 2)");
        assert!(ServiceState::Starting.is_active());
        assert!(!ServiceState::Stopped.is_active());
    }
}
