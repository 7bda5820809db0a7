//! Command-line interface for topology_launch

use argh::FromArgs;
use std::collections::HashMap;

/// Start a service topology in dependency order
#[derive(FromArgs, Debug)]
pub struct LaunchArgs {
    /// path to the topology file (default: topology.yaml)
    #[argh(positional, default = "String::from(\"topology.yaml\")")]
    pub topology_file: String,

    /// only launch these services and their dependencies (repeatable)
    #[argh(option, short = 's')]
    pub service: Vec<String>,

    /// set an interpolation variable (format: KEY:=value)
    #[argh(option, short = 'a', from_str_fn(parse_var_override))]
    pub arg: Vec<(String, String)>,

    /// container runtime: docker, podman or process (default: docker)
    #[argh(option, default = "String::from(\"docker\")", from_str_fn(parse_runtime))]
    pub runtime: String,

    /// project name (default: current directory name)
    #[argh(option, short = 'p')]
    pub project_name: Option<String>,

    /// network to attach containers to
    #[argh(option)]
    pub network: Option<String>,

    /// seconds each service gets to exit before it is killed (default: 10)
    #[argh(option, default = "10")]
    pub shutdown_timeout_secs: u64,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// print the launch plan as JSON (with --dry-run)
    #[argh(switch)]
    pub json: bool,

    /// validate topology file and exit
    #[argh(switch)]
    pub validate: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse variable override in format "KEY:=value"
fn parse_var_override(s: &str) -> Result<(String, String), String> {
    match s.split_once(":=") {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!(
            "Invalid variable format '{}'. Expected 'KEY:=value'",
            s
        )),
    }
}

/// Validate the runtime name
fn parse_runtime(s: &str) -> Result<String, String> {
    match s {
        "docker" | "podman" | "process" => Ok(s.to_string()),
        other => Err(format!(
            "Unknown runtime '{}'. Expected docker, podman or process",
            other
        )),
    }
}

impl LaunchArgs {
    /// Convert variable overrides to a HashMap
    pub fn var_overrides(&self) -> HashMap<String, String> {
        self.arg.iter().cloned().collect()
    }
}
