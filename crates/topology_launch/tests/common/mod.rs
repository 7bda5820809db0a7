//! Test helpers for launcher integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use topology_launch::runtime::{EventSender, ProcessError};
use topology_launch::{
    Container, ContainerRuntime, ExitStatus, InterpolationContext, RuntimeError, StartRequest,
    Topology,
};

/// The Anchore Engine deployment shipped with the repository
pub const ANCHORE_TOPOLOGY: &str = include_str!("../../../../topologies/anchore-engine.yaml");

/// Load a topology without consulting the process environment
pub fn load(source: &str) -> Topology {
    Topology::load_with(source, &InterpolationContext::isolated()).unwrap()
}

/// Something the fake runtime observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartBegin(String),
    StartEnd(String),
    Stop(String),
}

/// Shared record of runtime calls
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::StartEnd(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Stop(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn start_count(&self, service: &str) -> usize {
        self.started().iter().filter(|n| *n == service).count()
    }
}

/// In-memory runtime that records calls instead of running containers
#[derive(Debug, Default)]
pub struct FakeRuntime {
    pub log: CallLog,
    /// Services whose start fails
    failing: HashSet<String>,
    /// Exit code reported by a service's container on the first poll
    exits: HashMap<String, i32>,
    /// Time each start takes
    start_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, service: &str) -> Self {
        self.failing.insert(service.to_string());
        self
    }

    pub fn exiting(mut self, service: &str, code: i32) -> Self {
        self.exits.insert(service.to_string(), code);
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Highest number of starts that were in progress at the same time
    pub fn max_concurrent_starts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    fn command_line(&self, request: &StartRequest) -> Result<Vec<String>, RuntimeError> {
        let mut line = vec!["fake".to_string(), request.image.clone()];
        line.extend(request.command.iter().cloned());
        Ok(line)
    }

    async fn start(
        &self,
        request: &StartRequest,
        _events: EventSender,
    ) -> Result<Box<dyn Container>, RuntimeError> {
        self.log.push(Call::StartBegin(request.service.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&request.service) {
            return Err(RuntimeError::Process(ProcessError::SpawnFailed {
                name: request.service.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "image not found"),
            }));
        }

        self.log.push(Call::StartEnd(request.service.clone()));
        Ok(Box::new(FakeContainer {
            name: request.service.clone(),
            exit_code: self.exits.get(&request.service).copied(),
            log: self.log.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct FakeContainer {
    name: String,
    exit_code: Option<i32>,
    log: CallLog,
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> String {
        format!("fake-{}", self.name)
    }

    async fn try_wait(&mut self) -> Result<Option<ExitStatus>, RuntimeError> {
        Ok(self.exit_code.map(|code| ExitStatus { code: Some(code) }))
    }

    async fn stop(&mut self, _timeout: Duration) -> Result<ExitStatus, RuntimeError> {
        self.log.push(Call::Stop(self.name.clone()));
        Ok(ExitStatus { code: Some(0) })
    }
}
