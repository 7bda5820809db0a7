//! Topology document YAML schema definitions
//!
//! These types mirror the document as written. They are converted into the
//! validated [`crate::topology::Topology`] model by [`crate::topology::Topology::load`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Root topology document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyFile {
    /// Schema/version marker
    #[serde(default = "default_version")]
    pub version: String,

    /// Configuration shared by every service
    #[serde(default)]
    pub shared: SharedSection,

    /// Service definitions (ordered map, declaration order is significant)
    pub services: IndexMap<String, ServiceEntry>,

    /// Named volume definitions
    #[serde(default)]
    pub volumes: IndexMap<String, Option<VolumeEntry>>,

    /// Remaining top-level keys; only `x-` extension keys are accepted
    #[serde(flatten)]
    pub extensions: IndexMap<String, Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Top-level shared configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedSection {
    /// Environment variables injected into every service
    #[serde(default)]
    pub environment: EnvironmentEntry,
}

/// Scalar values accepted where the document expects a string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    /// Convert to string representation
    pub fn as_string(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::String(s) => s.clone(),
        }
    }
}

/// Environment can be a mapping or a list of `KEY=VALUE` strings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentEntry {
    Map(IndexMap<String, Option<ScalarValue>>),
    List(Vec<String>),
}

impl Default for EnvironmentEntry {
    fn default() -> Self {
        EnvironmentEntry::Map(IndexMap::new())
    }
}

impl EnvironmentEntry {
    /// Flatten into `(key, value)` pairs; `None` means no value was given
    pub fn pairs(&self) -> Vec<(String, Option<String>)> {
        match self {
            EnvironmentEntry::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(ScalarValue::as_string)))
                .collect(),
            EnvironmentEntry::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
        }
    }
}

/// Service definition as written in the document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    /// Container image reference
    #[serde(default)]
    pub image: Option<String>,

    /// Explicit container name (defaults to `<project>-<service>-1`)
    #[serde(default)]
    pub container_name: Option<String>,

    /// Services that must be started first
    #[serde(default)]
    pub depends_on: DependsOnEntry,

    /// Environment variables specific to this service
    #[serde(default)]
    pub environment: EnvironmentEntry,

    /// Container ports exposed to linked services
    #[serde(default)]
    pub expose: Vec<PortValue>,

    /// Published `host:container` port mappings
    #[serde(default)]
    pub ports: Vec<PortValue>,

    /// Command override
    #[serde(default)]
    pub command: Option<CommandEntry>,

    /// Volume mounts (`source:target[:mode]` or `target`)
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Log sink configuration
    #[serde(default)]
    pub logging: Option<LoggingEntry>,

    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Dependency list in short (list) or long (map) form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnEntry {
    /// `depends_on: [db, catalog]`
    List(Vec<String>),
    /// `depends_on: { db: { condition: service_started } }`
    Map(IndexMap<String, DependencyEntry>),
}

impl Default for DependsOnEntry {
    fn default() -> Self {
        DependsOnEntry::List(Vec::new())
    }
}

impl DependsOnEntry {
    /// Dependency names with their declared condition
    pub fn entries(&self) -> Vec<(String, DependencyCondition)> {
        match self {
            DependsOnEntry::List(names) => names
                .iter()
                .map(|n| (n.clone(), DependencyCondition::ServiceStarted))
                .collect(),
            DependsOnEntry::Map(map) => map
                .iter()
                .map(|(n, entry)| (n.clone(), entry.condition))
                .collect(),
        }
    }
}

/// Long-form dependency entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyEntry {
    #[serde(default)]
    pub condition: DependencyCondition,
}

/// Condition for a dependency to be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Dependency has been asked to start
    #[default]
    ServiceStarted,
    /// Dependency reports healthy
    ServiceHealthy,
    /// Dependency ran to completion
    ServiceCompletedSuccessfully,
}

/// A port written as an integer or a string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    /// Textual form of the port entry
    pub fn as_text(&self) -> String {
        match self {
            PortValue::Number(n) => n.to_string(),
            PortValue::Text(s) => s.clone(),
        }
    }
}

/// Command in shell-string or exec-list form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandEntry {
    /// Split into an argument vector
    pub fn to_args(&self) -> Vec<String> {
        match self {
            CommandEntry::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
            CommandEntry::Exec(args) => args.clone(),
        }
    }
}

/// Log driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingEntry {
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub options: IndexMap<String, ScalarValue>,
}

/// Named volume definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeEntry {
    /// Volume is created and managed outside of this topology
    #[serde(default)]
    pub external: bool,
    /// Name of the volume in the runtime, if different from the key
    #[serde(default)]
    pub name: Option<String>,
}

/// Restart policy for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    #[serde(rename = "no")]
    No,
    /// Always restart on exit
    #[serde(rename = "always")]
    Always,
    /// Only restart on failure (non-zero exit code)
    #[serde(rename = "on-failure")]
    OnFailure,
    /// Restart on any exit unless the launcher stopped the service.
    ///
    /// Restarts only happen while supervising and stopping cancels them,
    /// so within one launcher run this behaves like `Always`.
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
}

impl RestartPolicy {
    /// Policy name as written in the document
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

impl TopologyFile {
    /// Parse a topology document from an already interpolated YAML value
    pub fn from_value(value: Value) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_value(value)
    }

    /// Top-level keys that are neither known sections nor `x-` extensions
    pub fn unknown_sections(&self) -> Vec<&str> {
        self.extensions
            .keys()
            .filter(|k| !k.starts_with("x-"))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> TopologyFile {
        TopologyFile::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_simple_document() {
        let file = parse(
            r#"
version: "2.1"
services:
  db:
    image: "postgres:9"
  catalog:
    image: "anchore/anchore-engine:v0.8.1"
    depends_on:
      - db
"#,
        );
        assert_eq!(file.version, "2.1");
        assert_eq!(file.services.len(), 2);
        let order: Vec<_> = file.services.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["db", "catalog"]);
    }

    #[test]
    fn test_environment_forms() {
        let file = parse(
            r#"
services:
  a:
    image: x
    environment:
      PORT: 5432
      DEBUG: true
      NAME: api
      INHERITED:
  b:
    image: x
    environment:
      - PORT=5432
      - URL=http://a:1/?q=1
      - INHERITED
"#,
        );
        let a = file.services["a"].environment.pairs();
        assert_eq!(a[0], ("PORT".to_string(), Some("5432".to_string())));
        assert_eq!(a[1], ("DEBUG".to_string(), Some("true".to_string())));
        assert_eq!(a[3], ("INHERITED".to_string(), None));

        let b = file.services["b"].environment.pairs();
        assert_eq!(b[1], ("URL".to_string(), Some("http://a:1/?q=1".to_string())));
        assert_eq!(b[2], ("INHERITED".to_string(), None));
    }

    #[test]
    fn test_depends_on_forms() {
        let file = parse(
            r#"
services:
  db:
    image: x
  api:
    image: x
    depends_on:
      db:
        condition: service_healthy
"#,
        );
        let deps = file.services["api"].depends_on.entries();
        assert_eq!(
            deps,
            vec![("db".to_string(), DependencyCondition::ServiceHealthy)]
        );
    }

    #[test]
    fn test_restart_policy_values() {
        let file = parse(
            r#"
services:
  a:
    image: x
    restart: "no"
  b:
    image: x
    restart: on-failure
  c:
    image: x
"#,
        );
        assert_eq!(file.services["a"].restart, RestartPolicy::No);
        assert_eq!(file.services["b"].restart, RestartPolicy::OnFailure);
        assert_eq!(file.services["c"].restart, RestartPolicy::No);
    }

    #[test]
    fn test_unknown_service_field_rejected() {
        let value = serde_yaml::from_str(
            r#"
services:
  a:
    image: x
    imagee: typo
"#,
        )
        .unwrap();
        assert!(TopologyFile::from_value(value).is_err());
    }

    #[test]
    fn test_extension_sections() {
        let file = parse(
            r#"
x-common:
  foo: bar
bogus: 1
services: {}
"#,
        );
        assert_eq!(file.unknown_sections(), vec!["bogus"]);
    }

    #[test]
    fn test_command_forms() {
        assert_eq!(
            CommandEntry::Shell("anchore-manager service start  catalog".to_string()).to_args(),
            vec!["anchore-manager", "service", "start", "catalog"]
        );
        assert_eq!(
            CommandEntry::Exec(vec!["sh".into(), "-c".into(), "echo hi".into()]).to_args(),
            vec!["sh", "-c", "echo hi"]
        );
    }
}
