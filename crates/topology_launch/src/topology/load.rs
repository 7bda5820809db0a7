//! Loading and whole-document validation of topologies

use super::model::*;
use crate::config::{
    DependencyCondition, InterpolationContext, InterpolationError, ServiceEntry, TopologyFile,
};
use crate::runtime::{DependencyError, DependencyGraph};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

impl Topology {
    /// Parse and validate a topology document.
    ///
    /// Variables are resolved from the process environment.
    pub fn load(source: &str) -> Result<Self, TopologyError> {
        Self::load_with(source, &InterpolationContext::new())
    }

    /// Parse and validate a topology document with explicit variables
    pub fn load_with(source: &str, ctx: &InterpolationContext) -> Result<Self, TopologyError> {
        let mut value: serde_yaml::Value =
            serde_yaml::from_str(source).map_err(TopologyError::Parse)?;
        ctx.interpolate_value(&mut value)?;
        let file = TopologyFile::from_value(value).map_err(TopologyError::Parse)?;
        Self::from_document(file, ctx)
    }

    /// Load a topology document from disk
    pub fn from_file(
        path: impl AsRef<Path>,
        ctx: &InterpolationContext,
    ) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| TopologyError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::load_with(&content, ctx)
    }

    /// Convert a parsed document into a validated topology
    pub fn from_document(
        file: TopologyFile,
        ctx: &InterpolationContext,
    ) -> Result<Self, TopologyError> {
        if let Some(section) = file.unknown_sections().first() {
            return Err(ValidationError::UnknownSection(section.to_string()).into());
        }

        let mut volumes = IndexMap::new();
        for (name, entry) in &file.volumes {
            let entry = entry.clone().unwrap_or_default();
            volumes.insert(
                name.clone(),
                NamedVolume {
                    name: name.clone(),
                    external: entry.external,
                    runtime_name: entry.name,
                },
            );
        }

        let shared = SharedConfig {
            environment: resolve_environment(file.shared.environment.pairs(), ctx),
        };

        let mut services = IndexMap::new();
        for (name, entry) in &file.services {
            let spec = build_service(name, entry, &shared, &volumes, ctx)?;
            services.insert(name.clone(), spec);
        }

        for spec in services.values() {
            for dep in &spec.depends_on {
                if !services.contains_key(dep) {
                    return Err(ValidationError::UnknownDependency {
                        service: spec.name.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
        }

        let topology = Topology {
            version: file.version,
            shared,
            services,
            volumes,
        };

        DependencyGraph::build(&topology).map_err(|e| match e {
            DependencyError::CyclicDependency(names) => ValidationError::CyclicDependency(names),
            DependencyError::UnknownDependency {
                service,
                dependency,
            } => ValidationError::UnknownDependency {
                service,
                dependency,
            },
            DependencyError::UnknownService(service) => ValidationError::UnknownDependency {
                service: service.clone(),
                dependency: service,
            },
        })?;

        log::debug!(
            "Loaded topology version {} with {} services and {} volumes",
            topology.version,
            topology.services.len(),
            topology.volumes.len()
        );

        Ok(topology)
    }
}

/// Resolve environment pairs; entries without a value inherit from the context
fn resolve_environment(
    pairs: Vec<(String, Option<String>)>,
    ctx: &InterpolationContext,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for (key, value) in pairs {
        match value.or_else(|| ctx.lookup(&key)) {
            Some(value) => {
                env.insert(key, value);
            }
            None => log::debug!("Environment variable '{}' has no value, not passing it", key),
        }
    }
    env
}

fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn build_service(
    name: &str,
    entry: &ServiceEntry,
    shared: &SharedConfig,
    volumes: &IndexMap<String, NamedVolume>,
    ctx: &InterpolationContext,
) -> Result<ServiceSpec, ValidationError> {
    if !is_valid_service_name(name) {
        return Err(ValidationError::InvalidServiceName(name.to_string()));
    }

    let image = match entry.image.as_deref().map(str::trim) {
        Some(image) if !image.is_empty() => image.to_string(),
        _ => return Err(ValidationError::MissingImage(name.to_string())),
    };

    let mut depends_on = Vec::new();
    for (dep, condition) in entry.depends_on.entries() {
        if condition != DependencyCondition::ServiceStarted {
            return Err(ValidationError::UnsupportedCondition {
                service: name.to_string(),
                dependency: dep,
                condition,
            });
        }
        if !depends_on.contains(&dep) {
            depends_on.push(dep);
        }
    }

    // Shared values first, service values override
    let mut environment = shared.environment.clone();
    environment.extend(resolve_environment(entry.environment.pairs(), ctx));

    let expose = entry
        .expose
        .iter()
        .map(|p| ExposedPort::parse(&p.as_text()))
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(|reason| ValidationError::InvalidPort {
            service: name.to_string(),
            reason,
        })?;

    let ports = entry
        .ports
        .iter()
        .map(|p| PortMapping::parse(&p.as_text()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| ValidationError::InvalidPort {
            service: name.to_string(),
            reason,
        })?;

    let mut mounts = Vec::new();
    for text in &entry.volumes {
        let mount = VolumeMount::parse(text).map_err(|reason| ValidationError::InvalidVolume {
            service: name.to_string(),
            reason,
        })?;
        if let Some(volume) = mount.volume_name() {
            if !volumes.contains_key(volume) {
                return Err(ValidationError::UnresolvedVolume {
                    service: name.to_string(),
                    volume: volume.to_string(),
                });
            }
        }
        mounts.push(mount);
    }

    let logging = match &entry.logging {
        None => LogConfig::default(),
        Some(logging) => {
            let mut config = LogConfig::default();
            if let Some(driver) = &logging.driver {
                config.driver = driver.clone();
            }
            config.options = logging
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.as_string()))
                .collect();
            config
        }
    };
    if let Some(Err(reason)) = logging.max_size_bytes() {
        return Err(ValidationError::InvalidLogSize {
            service: name.to_string(),
            reason,
        });
    }

    Ok(ServiceSpec {
        name: name.to_string(),
        image,
        container_name: entry.container_name.clone(),
        depends_on,
        environment,
        expose,
        ports,
        command: entry.command.as_ref().map(|c| c.to_args()).unwrap_or_default(),
        volumes: mounts,
        logging,
        restart: entry.restart,
    })
}

/// Errors that can occur when loading a topology
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Failed to read topology file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse topology: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("Interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Violations of the topology invariants
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown top-level section '{0}'")]
    UnknownSection(String),

    #[error("Invalid service name '{0}'")]
    InvalidServiceName(String),

    #[error("Service '{0}' does not specify an image")]
    MissingImage(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Service '{service}' mounts undeclared volume '{volume}'")]
    UnresolvedVolume { service: String, volume: String },

    #[error("Service '{service}' has an invalid port: {reason}")]
    InvalidPort { service: String, reason: String },

    #[error("Service '{service}' has an invalid volume mount: {reason}")]
    InvalidVolume { service: String, reason: String },

    #[error("Service '{service}' has an invalid log max-size: {reason}")]
    InvalidLogSize { service: String, reason: String },

    #[error(
        "Service '{service}' uses unsupported condition {condition:?} on '{dependency}'; only service_started is supported"
    )]
    UnsupportedCondition {
        service: String,
        dependency: String,
        condition: DependencyCondition,
    },
}
