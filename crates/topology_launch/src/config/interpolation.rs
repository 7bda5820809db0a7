//! Variable interpolation for `${VAR}` patterns in topology documents

use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches `$$`, `${NAME}`, `${NAME<op>arg}`, a malformed `${`, or bare `$NAME`.
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(?P<escaped>\$)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>:?[-?])(?P<arg>[^}]*))?\}|(?P<invalid>\{)|(?P<bare>[A-Za-z_][A-Za-z0-9_]*))",
    )
    .unwrap()
});

/// Variables available to interpolation
#[derive(Debug, Clone)]
pub struct InterpolationContext {
    /// Explicit variables (take precedence over the process environment)
    pub vars: HashMap<String, String>,
    /// Whether to fall back to the process environment
    pub use_process_env: bool,
}

impl Default for InterpolationContext {
    fn default() -> Self {
        Self {
            vars: HashMap::new(),
            use_process_env: true,
        }
    }
}

impl InterpolationContext {
    /// Create a context backed by the process environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that only sees explicitly provided variables
    pub fn isolated() -> Self {
        Self {
            vars: HashMap::new(),
            use_process_env: false,
        }
    }

    /// Add a variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Add multiple variables
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Look up a variable, falling back to the process environment when enabled
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.vars.get(name) {
            return Some(value.clone());
        }
        if self.use_process_env {
            return std::env::var(name).ok();
        }
        None
    }

    /// Interpolate all variables in a single string
    pub fn interpolate(&self, input: &str) -> Result<String, InterpolationError> {
        let mut error: Option<InterpolationError> = None;

        let result = VARIABLE_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }
            match self.resolve_capture(input, caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(result.into_owned()),
        }
    }

    fn resolve_capture(&self, input: &str, caps: &Captures) -> Result<String, InterpolationError> {
        if caps.name("escaped").is_some() {
            return Ok("$".to_string());
        }

        if caps.name("invalid").is_some() {
            return Err(InterpolationError::InvalidFormat(input.to_string()));
        }

        if let Some(name) = caps.name("bare") {
            return Ok(self.resolve_plain(name.as_str()));
        }

        let name = match caps.name("braced") {
            Some(name) => name.as_str(),
            None => return Err(InterpolationError::InvalidFormat(input.to_string())),
        };
        let arg = caps.name("arg").map(|m| m.as_str()).unwrap_or("");
        if arg.contains("${") {
            return Err(InterpolationError::InvalidFormat(format!(
                "nested substitution in '{}'",
                input
            )));
        }
        let value = self.lookup(name);

        match caps.name("op").map(|m| m.as_str()) {
            None => Ok(self.resolve_plain(name)),
            Some(":-") => match value.filter(|v| !v.is_empty()) {
                Some(value) => Ok(value),
                None => self.interpolate(arg),
            },
            Some("-") => match value {
                Some(value) => Ok(value),
                None => self.interpolate(arg),
            },
            Some(":?") => value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| InterpolationError::Required {
                    name: name.to_string(),
                    message: arg.to_string(),
                }),
            Some("?") => value.ok_or_else(|| InterpolationError::Required {
                name: name.to_string(),
                message: arg.to_string(),
            }),
            Some(other) => Err(InterpolationError::InvalidFormat(format!(
                "unsupported operator '{}' in '{}'",
                other, input
            ))),
        }
    }

    fn resolve_plain(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_else(|| {
            log::warn!("Variable '{}' is not set, defaulting to an empty string", name);
            String::new()
        })
    }

    /// Interpolate every string scalar of a YAML document in place.
    ///
    /// Mapping keys are left untouched.
    pub fn interpolate_value(&self, value: &mut Value) -> Result<(), InterpolationError> {
        match value {
            Value::String(s) => {
                if s.contains('$') {
                    *s = self.interpolate(s)?;
                }
            }
            Value::Sequence(items) => {
                for item in items {
                    self.interpolate_value(item)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate_value(item)?;
                }
            }
            Value::Tagged(tagged) => self.interpolate_value(&mut tagged.value)?,
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }
}

/// Errors that can occur during interpolation
#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("Required variable '{name}' is missing a value: {message}")]
    Required { name: String, message: String },

    #[error("Invalid interpolation format in: {0}")]
    InvalidFormat(String),
}
