//! Validated, immutable topology model

use crate::config::RestartPolicy;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

/// `<number>[ ][unit][i][b]`, matched against the lowercased size
static SIZE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+(?:\.\d+)?) ?(?P<unit>[kmgtp])?i?b?$").unwrap()
});

/// A fully validated service topology
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    /// Schema/version marker from the document
    pub version: String,
    /// Configuration threaded into every service
    pub shared: SharedConfig,
    /// Services in declaration order
    pub services: IndexMap<String, ServiceSpec>,
    /// Named volumes in declaration order
    pub volumes: IndexMap<String, NamedVolume>,
}

impl Topology {
    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Service names in declaration order
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// Configuration shared by all services (credentials, hostnames, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedConfig {
    pub environment: BTreeMap<String, String>,
}

/// One service's declared image, dependencies and runtime parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub container_name: Option<String>,
    /// Names of services that must be started first
    pub depends_on: Vec<String>,
    /// Shared environment merged with service-specific values
    pub environment: BTreeMap<String, String>,
    pub expose: BTreeSet<ExposedPort>,
    pub ports: Vec<PortMapping>,
    /// Command override; empty means the image default
    pub command: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub logging: LogConfig,
    pub restart: RestartPolicy,
}

/// Transport protocol of a published or exposed port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A published `host:container` port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    /// `None` lets the runtime pick an ephemeral host port
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// Parse the short syntax `[[ip:]host:]container[/protocol]`
    pub fn parse(text: &str) -> Result<Self, String> {
        let (spec, protocol) = split_protocol(text)?;

        let parts: Vec<&str> = spec.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [container] => (None, None, *container),
            [host, container] => (None, Some(*host), *container),
            [ip, host, container] => (Some(*ip), Some(*host), *container),
            _ => return Err(format!("cannot parse port mapping '{}'", text)),
        };

        let host_port = match host {
            Some(h) if !h.is_empty() => Some(parse_port(h)?),
            _ => None,
        };

        Ok(Self {
            host_ip: host_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
            host_port,
            container_port: parse_port(container)?,
            protocol,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        match self.host_port {
            Some(host) => write!(f, "{}:", host)?,
            None if self.host_ip.is_some() => write!(f, ":")?,
            None => {}
        }
        write!(f, "{}", self.container_port)?;
        if self.protocol == Protocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

/// A container port exposed to linked services
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ExposedPort {
    /// Parse `port[/protocol]`
    pub fn parse(text: &str) -> Result<Self, String> {
        let (port, protocol) = split_protocol(text)?;
        Ok(Self {
            port: parse_port(port)?,
            protocol,
        })
    }
}

impl fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.port)?;
        if self.protocol == Protocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

/// Split an optional `/tcp` or `/udp` suffix
fn split_protocol(text: &str) -> Result<(&str, Protocol), String> {
    match text.rsplit_once('/') {
        Some((spec, "tcp")) => Ok((spec, Protocol::Tcp)),
        Some((spec, "udp")) => Ok((spec, Protocol::Udp)),
        Some((_, other)) => Err(format!("unsupported protocol '{}'", other)),
        None => Ok((text, Protocol::Tcp)),
    }
}

/// Parse a single port number in `1..=65535`
pub fn parse_port(text: &str) -> Result<u16, String> {
    match text.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{}' is not a valid port number", text)),
        Ok(port) => Ok(port),
    }
}

/// Where a mount's data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Fresh volume owned by the container
    Anonymous,
    /// Bind mount of a host path
    HostPath(String),
    /// Reference to a declared named volume
    Named(String),
}

/// A volume mount into a service container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    /// Parse the short syntax `target` or `source:target[:mode]`
    pub fn parse(text: &str) -> Result<Self, String> {
        let parts: Vec<&str> = text.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => return Err(format!("cannot parse volume mount '{}'", text)),
        };

        if !target.starts_with('/') {
            return Err(format!("container path '{}' must be absolute", target));
        }

        let source = match source {
            None => MountSource::Anonymous,
            Some("") => return Err(format!("empty volume source in '{}'", text)),
            Some(s) if s.starts_with('/') || s.starts_with('.') || s.starts_with('~') => {
                MountSource::HostPath(s.to_string())
            }
            Some(s) => MountSource::Named(s.to_string()),
        };

        let read_only = match mode {
            None => false,
            Some(mode) => {
                let mut read_only = false;
                for option in mode.split(',') {
                    match option {
                        "ro" => read_only = true,
                        "rw" | "z" | "Z" | "cached" | "delegated" | "consistent" | "nocopy" => {}
                        other => return Err(format!("unknown mount option '{}'", other)),
                    }
                }
                read_only
            }
        };

        Ok(Self {
            source,
            target: target.to_string(),
            read_only,
        })
    }

    /// Named volume referenced by this mount, if any
    pub fn volume_name(&self) -> Option<&str> {
        match &self.source {
            MountSource::Named(name) => Some(name),
            _ => None,
        }
    }
}

/// Log sink configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            driver: "json-file".to_string(),
            options: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// The `max-size` option, if set
    pub fn max_size(&self) -> Option<&str> {
        self.options.get("max-size").map(String::as_str)
    }

    /// The `max-size` option converted to bytes
    pub fn max_size_bytes(&self) -> Option<Result<u64, String>> {
        self.max_size().map(parse_size)
    }
}

/// Parse a log size such as `100m`, `1.5g`, `100MB`, `512KiB` or `2048` into
/// bytes. Units are binary, as the json-file log driver reads them.
pub fn parse_size(text: &str) -> Result<u64, String> {
    let invalid = || format!("'{}' is not a valid size", text);
    let lower = text.trim().to_ascii_lowercase();
    let caps = SIZE_PATTERN.captures(&lower).ok_or_else(invalid)?;

    let number: f64 = caps["number"].parse().map_err(|_| invalid())?;
    let multiplier: u64 = match caps.name("unit").map(|m| m.as_str()) {
        None => 1,
        Some("k") => 1 << 10,
        Some("m") => 1 << 20,
        Some("g") => 1 << 30,
        Some("t") => 1 << 40,
        Some("p") => 1 << 50,
        Some(_) => return Err(invalid()),
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// A named volume declared at the top level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedVolume {
    pub name: String,
    /// Volume is managed outside of this topology
    pub external: bool,
    /// Explicit runtime name, if different from `name`
    pub runtime_name: Option<String>,
}

impl NamedVolume {
    /// Name of the volume in the container runtime.
    ///
    /// Managed volumes are scoped by project, external ones keep their name.
    pub fn runtime_name(&self, project: &str) -> String {
        match (&self.runtime_name, self.external) {
            (Some(name), _) => name.clone(),
            (None, true) => self.name.clone(),
            (None, false) => format!("{}_{}", project, self.name),
        }
    }
}
