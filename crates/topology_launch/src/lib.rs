//! Topology Launch
//!
//! A compose-style launcher that brings up a declared set of services in
//! dependency order.
//!
//! # Overview
//!
//! The launcher allows you to:
//! - Declare services, their images, environment, ports and volumes in YAML
//! - Share configuration (credentials, hostnames) across every service
//! - Start services concurrently as soon as their dependencies have started
//! - Restart exited services according to their restart policy
//! - Stop services in reverse dependency order
//!
//! A dependency is satisfied once the runtime reports it started. There is
//! no readiness probing.
//!
//! # Example Topology
//!
//! ```yaml
//! version: "2.1"
//!
//! shared:
//!   environment:
//!     ANCHORE_DB_HOST: anchore-db
//!     ANCHORE_DB_PASSWORD: "${DB_PASSWORD:-mysecretpassword}"
//!
//! services:
//!   anchore-db:
//!     image: "postgres:9"
//!     volumes:
//!       - "anchore-db-volume:/var/lib/postgresql/data"
//!
//!   catalog:
//!     image: "anchore/anchore-engine:v0.8.1"
//!     depends_on:
//!       - anchore-db
//!     command: ["anchore-manager", "service", "start", "catalog"]
//!
//! volumes:
//!   anchore-db-volume:
//!     external: false
//! ```

pub mod cli;
pub mod config;
pub mod runtime;
pub mod topology;

pub use cli::LaunchArgs;
pub use config::{InterpolationContext, InterpolationError, RestartPolicy, TopologyFile};
pub use runtime::{
    CliRuntime, Container, ContainerRuntime, DependencyError, DependencyGraph, ExitStatus,
    LaunchError, LaunchPlan, Launcher, LauncherConfig, ProcessEvent, ProcessRuntime, RunningSet,
    RuntimeError, ServiceLaunchError, ServiceState, ServiceStatus, StartRequest,
};
pub use topology::{ServiceSpec, SharedConfig, Topology, TopologyError, ValidationError};
